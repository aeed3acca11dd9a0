//! Records-per-job budget.

use serde::{Deserialize, Serialize};

/// How many records each job receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBudget {
    /// Records per job for uncapped targets
    pub records_per_job: usize,

    /// Job cap applied to large targets
    pub max_jobs_for_large_target: usize,

    /// Whether the cap applies
    pub is_large_target: bool,
}

impl JobBudget {
    /// Records per job for an input of `record_count` records.
    ///
    /// Large targets get `ceil(record_count / max_jobs)`, so the chunk count
    /// never exceeds the cap.
    pub fn effective_records_per_job(&self, record_count: usize) -> usize {
        let per_job = if self.is_large_target {
            record_count.div_ceil(self.max_jobs_for_large_target.max(1))
        } else {
            self.records_per_job
        };
        per_job.max(1)
    }

    /// Number of chunks an input of `record_count` records produces.
    pub fn chunk_count(&self, record_count: usize) -> usize {
        record_count.div_ceil(self.effective_records_per_job(record_count))
    }
}
