//! Run orchestration.
//!
//! A run splits the input into chunks, writes one script per chunk,
//! dispatches the scripts, waits for their sentinels, then merges and
//! verifies the results. Stages run in order; only the local job pool runs
//! work concurrently.

use crate::chunk::{Chunker, JobChunk, JobStatus};
use crate::config::{Config, DispatchMode};
use crate::error::SchedulerError;
use crate::io::{count_records, RunManifest, SequenceSet, WorkLayout};
use crate::job::JobBuilder;
use crate::pipeline::{
    CompletionPoller, CompletionWatcher, Dispatcher, ErrorReporter, GridEngineClient, MergedResult,
    Metrics, MetricsReporter, MetricsSnapshot, PollOutcome, QueueClient, QueueWarning,
    ResultAggregator, SentinelWatcher, SubmissionResult,
};
use crate::target::QueueProfile;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Results merged and verified
    Completed(MergedResult),

    /// Queue unavailable or a submission was rejected. `recipe` holds
    /// every issued command; `replay` only those the queue never accepted.
    Degraded {
        reason: String,
        recipe: PathBuf,
        replay: PathBuf,
        pending: usize,
    },
}

/// Everything a finished run reports.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: SchedulerStats,
    pub outcome: RunOutcome,
    pub warnings: Vec<QueueWarning>,
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Degraded { .. })
    }
}

/// Drives one run from input file to verified output.
pub struct Scheduler {
    config: Arc<Config>,
    layout: Arc<WorkLayout>,
    client: Arc<dyn QueueClient>,
    watcher: Arc<dyn CompletionWatcher>,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    /// Create a scheduler using the grid-engine client and sentinel files.
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            layout: Arc::new(WorkLayout::from_config(&config)),
            client: Arc::new(GridEngineClient::new(&config.queue)),
            watcher: Arc::new(SentinelWatcher),
            config,
            metrics,
        }
    }

    /// Use a different queue client.
    pub fn with_client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.client = client;
        self
    }

    /// Use a different completion watcher.
    pub fn with_watcher(mut self, watcher: Arc<dyn CompletionWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    fn poller(&self) -> CompletionPoller {
        CompletionPoller::new(
            self.watcher.clone(),
            self.config.polling.tick(),
            self.config.polling.timeout(),
            self.metrics.clone(),
        )
    }

    /// Run every stage.
    pub async fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        let layout = &self.layout;

        layout
            .create_dirs()
            .with_context(|| format!("Failed to prepare run directory {}", layout.root().display()))?;

        let seq_set = SequenceSet::open(&config.input.query)
            .with_context(|| format!("Failed to read query file {}", config.input.query.display()))?;
        let input_records = seq_set.record_count();
        let budget = config.job_budget();

        let split_start = Instant::now();
        let chunker = Chunker::new(layout.clone(), self.metrics.clone());
        let chunks = chunker.split(&seq_set, &budget)?;
        Chunker::verify_partition(&chunks, input_records)?;
        self.metrics.add_split_time(split_start.elapsed());

        let mut stats = SchedulerStats {
            input_records,
            records_per_job: budget.effective_records_per_job(input_records),
            total_chunks: chunks.len(),
            ..Default::default()
        };

        let builder = JobBuilder::from_config(config, self.metrics.clone());
        for chunk in &chunks {
            builder.build(chunk, &config.target)?;
        }
        // Only once every chunk file belongs to this run
        layout.write_db_version(config.target.kind, &config.target.database)?;

        let profile = config.queue_profile();
        let mut manifest = RunManifest::new(layout, config.target.kind, profile.clone(), input_records, &chunks);
        manifest.save()?;
        tracing::debug!("Run manifest written to {}", manifest.path().display());

        self.dispatch(&chunks, &profile, &mut manifest, &mut stats).await?;

        if let Some(reason) = manifest.degraded.clone() {
            return self.finish_degraded(reason, manifest, stats);
        }

        if config.dispatch.mode == DispatchMode::Queue {
            if let Err(e) = self.poller().await_run(&manifest).await {
                manifest.finalize(format!("failed: {}", e))?;
                return Err(e.into());
            }
        }

        self.aggregate(&chunks, input_records, manifest, stats).await
    }

    async fn dispatch(
        &self,
        chunks: &[JobChunk],
        profile: &QueueProfile,
        manifest: &mut RunManifest,
        stats: &mut SchedulerStats,
    ) -> Result<()> {
        let config = &self.config;
        let start = Instant::now();
        let mut dispatcher = Dispatcher::new(
            config.dispatch.mode,
            self.client.clone(),
            self.layout.clone(),
            self.metrics.clone(),
            config.dispatch.local_workers,
        );

        match config.dispatch.mode {
            DispatchMode::Queue => {
                tracing::info!("Submitting {} jobs to queue {}", chunks.len(), profile.queue_name);
                for chunk in chunks {
                    match dispatcher.submit(chunk, profile, manifest).await? {
                        SubmissionResult::Submitted { .. } => stats.jobs_submitted += 1,
                        SubmissionResult::Degraded { .. } => stats.jobs_degraded += 1,
                        SubmissionResult::Completed { .. } => stats.jobs_completed += 1,
                    }
                }
            }
            DispatchMode::Local => {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
                let reporter_handle = if config.processing.enable_metrics {
                    let reporter = MetricsReporter::new(
                        self.metrics.clone(),
                        config.processing.metrics_interval_secs,
                        chunks.len() as u64,
                    );
                    Some(tokio::spawn(reporter.run(shutdown_rx)))
                } else {
                    drop(shutdown_rx);
                    None
                };

                let result = dispatcher.run_local_pool(chunks, manifest).await;

                let _ = shutdown_tx.send(()).await;
                if let Some(handle) = reporter_handle {
                    let _ = handle.await;
                }

                match result {
                    Ok(exits) => {
                        stats.jobs_submitted = exits.len();
                        stats.jobs_completed = exits.len();
                    }
                    Err(e) => {
                        manifest.finalize(format!("failed: {}", e))?;
                        return Err(e.into());
                    }
                }
            }
        }

        self.metrics.add_dispatch_time(start.elapsed());
        manifest.save()?;
        Ok(())
    }

    fn finish_degraded(
        &self,
        reason: String,
        mut manifest: RunManifest,
        stats: SchedulerStats,
    ) -> Result<RunReport> {
        let recipe = manifest.recipe_path().to_path_buf();
        let replay = self.layout.replay();
        let pending = manifest.write_replay(&replay)?;
        tracing::warn!("Run degraded: {}", reason);
        tracing::warn!(
            "{} of {} job(s) not accepted by the queue; replay them with `bash {}`, then run `collect` on {}",
            pending,
            manifest.chunks.len(),
            replay.display(),
            self.layout.root().display()
        );

        let warnings = ErrorReporter::inspect(&self.layout.queue_err());

        manifest.finalize("degraded")?;
        self.report_metrics();
        Ok(RunReport {
            stats,
            outcome: RunOutcome::Degraded {
                reason,
                recipe,
                replay,
                pending,
            },
            warnings,
            metrics: self.metrics.snapshot(),
        })
    }

    async fn aggregate(
        &self,
        chunks: &[JobChunk],
        input_records: usize,
        mut manifest: RunManifest,
        mut stats: SchedulerStats,
    ) -> Result<RunReport> {
        let aggregator = ResultAggregator::from_config(&self.config, self.layout.clone(), self.metrics.clone());
        let merged = match aggregator.merge(chunks, input_records, &mut manifest).await {
            Ok(merged) => merged,
            Err(e) => {
                manifest.finalize(format!("failed: {}", e))?;
                return Err(e.into());
            }
        };
        stats.records_verified = merged.records;
        stats.jobs_completed = chunks.len();

        let warnings = if self.config.dispatch.mode == DispatchMode::Queue {
            ErrorReporter::inspect(&self.layout.queue_err())
        } else {
            Vec::new()
        };

        manifest.finalize("completed")?;
        tracing::info!("Run complete: {}", stats);
        self.report_metrics();

        Ok(RunReport {
            stats,
            outcome: RunOutcome::Completed(merged),
            warnings,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Finish a run whose recipe was replayed by hand: wait for every
    /// sentinel, then merge and verify.
    pub async fn collect(&self) -> Result<RunReport> {
        let manifest = RunManifest::load(&self.layout).with_context(|| {
            format!("No run manifest in {}", self.layout.root().display())
        })?;
        let chunks = manifest.job_chunks();
        let input_records = manifest.input_records;

        // The degraded marker stays in the manifest as history; collect polls regardless.
        match self.poller().await_all(&chunks, &manifest.queue).await? {
            PollOutcome::Done { elapsed, scans } => tracing::info!(
                "All {} jobs done after {:.0}s ({} scans)",
                chunks.len(),
                elapsed.as_secs_f64(),
                scans
            ),
            PollOutcome::ShortCircuited { reason } => {
                return Err(anyhow::anyhow!("Polling stopped: {}", reason));
            }
        }

        let stats = SchedulerStats {
            input_records,
            records_per_job: chunks.iter().map(|c| c.record_count).max().unwrap_or(0),
            total_chunks: chunks.len(),
            jobs_submitted: chunks.len(),
            ..Default::default()
        };
        self.aggregate(&chunks, input_records, manifest, stats).await
    }

    /// Status of every chunk of the run in the output directory.
    pub fn status(&self) -> Result<Vec<(usize, JobStatus)>> {
        let manifest = RunManifest::load(&self.layout).with_context(|| {
            format!("No run manifest in {}", self.layout.root().display())
        })?;
        Ok(manifest.statuses())
    }

    /// Count the input and size the run without writing anything.
    pub fn estimate_work(&self) -> Result<WorkEstimate> {
        let input_records = count_records(&self.config.input.query)?;
        if input_records == 0 {
            return Err(SchedulerError::EmptyInput {
                path: self.config.input.query.clone(),
            }
            .into());
        }
        let budget = self.config.job_budget();
        Ok(WorkEstimate {
            input_records,
            records_per_job: budget.effective_records_per_job(input_records),
            total_chunks: budget.chunk_count(input_records),
            is_large_target: budget.is_large_target,
            queue: self.config.queue_profile(),
            mode: self.config.dispatch.mode,
        })
    }

    fn report_metrics(&self) {
        let processing = &self.config.processing;
        if !processing.enable_metrics {
            return;
        }
        let reporter = MetricsReporter::new(
            self.metrics.clone(),
            processing.metrics_interval_secs,
            self.metrics.snapshot().chunks_written,
        );
        reporter.print_summary();

        if let Some(ref path) = processing.metrics_output_path {
            let snapshot = self.metrics.snapshot();
            if let Err(e) = snapshot.save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }
}

/// Statistics from a scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Records in the query input
    pub input_records: usize,

    /// Records per chunk after the large-target cap
    pub records_per_job: usize,

    /// Chunks written
    pub total_chunks: usize,

    /// Jobs accepted by the queue or started locally
    pub jobs_submitted: usize,

    /// Jobs recorded for manual replay
    pub jobs_degraded: usize,

    /// Jobs known to be done
    pub jobs_completed: usize,

    /// Records counted in the verified output
    pub records_verified: usize,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Records: {} in {} chunks, Submitted: {}, Degraded: {}, Done: {}, Verified: {}",
            self.input_records,
            self.total_chunks,
            self.jobs_submitted,
            self.jobs_degraded,
            self.jobs_completed,
            self.records_verified
        )
    }
}

/// Size of a run, computed before anything is written.
#[derive(Debug, Clone)]
pub struct WorkEstimate {
    pub input_records: usize,
    pub records_per_job: usize,
    pub total_chunks: usize,
    pub is_large_target: bool,
    pub queue: QueueProfile,
    pub mode: DispatchMode,
}

impl std::fmt::Display for WorkEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Records: {}, Chunks: {} of up to {} records{}, Queue: {} (scan every {}s), Mode: {:?}",
            self.input_records,
            self.total_chunks,
            self.records_per_job,
            if self.is_large_target { " (capped)" } else { "" },
            self.queue.queue_name,
            self.queue.poll_interval_secs,
            self.mode
        )
    }
}
