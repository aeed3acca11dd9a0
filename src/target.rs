//! Reference targets and their queue profiles.
//!
//! Each reference database the aligner can search is a variant of
//! [`ReferenceTarget`]. Polling cadence and job caps are looked up from a
//! static table keyed by the variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference database searched by the aligner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTarget {
    /// NCBI nucleotide collection (very large)
    NcbiNt,
    /// NCBI 16S rRNA RefSeq
    Ncbi16s,
    /// SILVA SSU
    Silva,
    /// Greengenes 16S
    Greengenes,
    /// UNITE ITS
    Unite,
    /// User-supplied database
    Custom,
}

/// Scheduling properties of a reference target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProfile {
    /// Seconds between authoritative completion scans
    pub poll_interval_secs: u64,

    /// Upper bound on jobs submitted for a large target
    pub max_jobs_for_large_target: usize,

    /// Whether the job count must be capped
    pub is_large_target: bool,
}

const PROFILES: &[(ReferenceTarget, TargetProfile)] = &[
    (
        ReferenceTarget::NcbiNt,
        TargetProfile {
            poll_interval_secs: 300,
            max_jobs_for_large_target: 100,
            is_large_target: true,
        },
    ),
    (
        ReferenceTarget::Ncbi16s,
        TargetProfile {
            poll_interval_secs: 60,
            max_jobs_for_large_target: 100,
            is_large_target: false,
        },
    ),
    (
        ReferenceTarget::Silva,
        TargetProfile {
            poll_interval_secs: 60,
            max_jobs_for_large_target: 100,
            is_large_target: false,
        },
    ),
    (
        ReferenceTarget::Greengenes,
        TargetProfile {
            poll_interval_secs: 60,
            max_jobs_for_large_target: 100,
            is_large_target: false,
        },
    ),
    (
        ReferenceTarget::Unite,
        TargetProfile {
            poll_interval_secs: 60,
            max_jobs_for_large_target: 100,
            is_large_target: false,
        },
    ),
    (
        ReferenceTarget::Custom,
        TargetProfile {
            poll_interval_secs: 60,
            max_jobs_for_large_target: 100,
            is_large_target: false,
        },
    ),
];

impl ReferenceTarget {
    /// All known targets, in table order.
    pub fn all() -> impl Iterator<Item = ReferenceTarget> {
        PROFILES.iter().map(|(target, _)| *target)
    }

    /// Look up the scheduling profile for this target.
    pub fn profile(self) -> TargetProfile {
        PROFILES
            .iter()
            .find(|(target, _)| *target == self)
            .map(|(_, profile)| *profile)
            // Every variant has a table row; see test_every_target_has_profile.
            .unwrap_or(TargetProfile {
                poll_interval_secs: 60,
                max_jobs_for_large_target: 100,
                is_large_target: false,
            })
    }

    /// Name used in provenance files and logs.
    pub fn name(self) -> &'static str {
        match self {
            ReferenceTarget::NcbiNt => "NCBI_NT",
            ReferenceTarget::Ncbi16s => "NCBI_16S",
            ReferenceTarget::Silva => "SILVA",
            ReferenceTarget::Greengenes => "GREENGENES",
            ReferenceTarget::Unite => "UNITE",
            ReferenceTarget::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for ReferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Queue and polling cadence used for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueProfile {
    /// Queue the job scripts are submitted to
    pub queue_name: String,

    /// Seconds between authoritative completion scans
    pub poll_interval_secs: u64,
}
