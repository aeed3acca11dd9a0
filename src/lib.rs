//! Batch alignment job scheduler
//!
//! Splits a FASTA query file into chunks, writes one alignment job script per
//! chunk, submits the scripts to a grid queue (or runs them locally), waits
//! for their completion sentinels, then merges the per-chunk results and
//! verifies that no query record was lost.
//!
//! # Architecture
//!
//! - **Chunk**: record-count budgets and the streaming input splitter
//! - **Job**: argument-list commands and per-chunk job scripts
//! - **I/O**: FASTA reading, the run directory layout and the run manifest
//! - **Pipeline**: dispatch, completion polling, aggregation and metrics
//!
//! # Usage
//!
//! ```no_run
//! use align_batch::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod error;
pub mod io;
pub mod job;
pub mod pipeline;
pub mod target;

pub use chunk::{Chunker, JobBudget, JobChunk, JobStatus};
pub use config::Config;
pub use error::SchedulerError;
pub use io::{RunManifest, SequenceSet, WorkLayout};
pub use job::JobBuilder;
pub use pipeline::{
    CompletionPoller, Dispatcher, ErrorReporter, Metrics, ResultAggregator, RunOutcome, RunReport,
    Scheduler, SchedulerStats,
};
pub use target::{QueueProfile, ReferenceTarget, TargetProfile};

use anyhow::Result;
use std::sync::Arc;

/// Run the full scheduler with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<RunReport> {
    config.validate()?;

    tracing::info!("Starting batch alignment run");
    tracing::info!(
        "Query {} against {} ({})",
        config.input.query.display(),
        config.target.database,
        config.target.kind
    );

    let scheduler = Scheduler::new(Arc::new(config), Metrics::new());

    let estimate = scheduler.estimate_work()?;
    tracing::info!("Work estimate: {}", estimate);

    let report = scheduler.run().await?;
    match &report.outcome {
        RunOutcome::Completed(merged) => {
            tracing::info!("Results written to {}", merged.verified_path.display())
        }
        RunOutcome::Degraded { replay, pending, .. } => {
            tracing::warn!("{} job(s) not submitted; replay {}", pending, replay.display())
        }
    }

    Ok(report)
}

/// Wait for, merge and verify a run whose jobs were replayed by hand.
pub async fn collect_run(config: Config) -> Result<RunReport> {
    config.validate()?;
    let scheduler = Scheduler::new(Arc::new(config), Metrics::new());
    scheduler.collect().await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used for chunk recounts.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
