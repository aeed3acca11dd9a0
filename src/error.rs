//! Error types for the job scheduler.
//!
//! Component operations return [`Result`]. The orchestration layer and the CLI
//! wrap these in `anyhow` with context; callers that need to branch on the
//! failure kind can `downcast_ref::<SchedulerError>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the chunk/dispatch/poll/aggregate components.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Input contains no sequence records: {}", path.display())]
    EmptyInput { path: PathBuf },

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("Chunk {index} already has files from another run: {}", path.display())]
    ScriptCollision { index: usize, path: PathBuf },

    #[error("Local jobs exited non-zero for chunks {failed:?}")]
    LocalJobFailed { failed: Vec<usize> },

    #[error("Gave up after {waited_secs}s waiting for chunks {pending:?}")]
    WaitTimeout { pending: Vec<usize>, waited_secs: u64 },

    #[error("Chunk {index} is done but its result is missing: {}", path.display())]
    MissingResult { index: usize, path: PathBuf },

    #[error("Downstream step '{step}' failed (exit code {code:?}): {stderr}")]
    DownstreamFailed {
        step: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Merged output has {actual} records but the input had {expected}")]
    Integrity { expected: usize, actual: usize },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SchedulerError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for scheduler components.
pub type Result<T> = std::result::Result<T, SchedulerError>;
