//! Job chunks and how the input is divided into them.

mod budget;
mod chunker;

pub use budget::JobBudget;
pub use chunker::Chunker;
pub(crate) use chunker::create_new;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Output files owned by one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOutputs {
    /// Raw aligner output
    pub archive: PathBuf,

    /// Converted result
    pub result: PathBuf,
}

/// One unit of work: a contiguous run of input records and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobChunk {
    /// Position in input order, starting at 1
    pub index: usize,

    /// Records written to `input_path`
    pub record_count: usize,

    pub input_path: PathBuf,
    pub script_path: PathBuf,
    pub sentinel_path: PathBuf,
    pub outputs: ChunkOutputs,
}

impl JobChunk {
    /// Whether the chunk's job has reported completion.
    pub fn is_done(&self) -> bool {
        self.sentinel_path.exists()
    }
}

/// Status of a chunk's job, derived from the sentinel file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Submitted,
    Done,
}

impl JobStatus {
    /// Observe a chunk's status; `submitted` comes from the run manifest.
    pub fn observe(chunk: &JobChunk, submitted: bool) -> Self {
        if chunk.is_done() {
            JobStatus::Done
        } else if submitted {
            JobStatus::Submitted
        } else {
            JobStatus::Pending
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitted => "submitted",
            JobStatus::Done => "done",
        };
        f.write_str(s)
    }
}
