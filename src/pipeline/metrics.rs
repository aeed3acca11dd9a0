//! Run counters and progress reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Chunk input files written
    pub chunks_written: AtomicU64,

    /// Records written across all chunk files
    pub records_written: AtomicU64,

    /// Job scripts written
    pub scripts_built: AtomicU64,

    /// Jobs accepted by the queue or started locally
    pub jobs_submitted: AtomicU64,

    /// Jobs that finished successfully
    pub jobs_completed: AtomicU64,

    /// Local jobs that exited non-zero
    pub jobs_failed: AtomicU64,

    /// Submissions recorded to the recipe only
    pub jobs_degraded: AtomicU64,

    /// Full sentinel scans made by the poller
    pub poll_scans: AtomicU64,

    /// Downstream steps run by the aggregator
    pub steps_run: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds)
    /// Time spent splitting the input
    pub split_us: AtomicU64,

    /// Time spent submitting or running jobs
    pub dispatch_us: AtomicU64,

    /// Time spent waiting on sentinels
    pub wait_us: AtomicU64,

    /// Time spent merging and verifying
    pub aggregate_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a closed chunk file.
    pub fn add_chunk_written(&self, records: u64) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_script_built(&self) {
        self.scripts_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the completed count from an authoritative scan.
    pub fn set_jobs_completed(&self, count: u64) {
        self.jobs_completed.store(count, Ordering::Relaxed);
    }

    pub fn add_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_job_degraded(&self) {
        self.jobs_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_poll_scan(&self) {
        self.poll_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_step_run(&self) {
        self.steps_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_split_time(&self, duration: Duration) {
        self.split_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_dispatch_time(&self, duration: Duration) {
        self.dispatch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_wait_time(&self, duration: Duration) {
        self.wait_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_aggregate_time(&self, duration: Duration) {
        self.aggregate_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |v: &AtomicU64| v.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            scripts_built: self.scripts_built.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_degraded: self.jobs_degraded.load(Ordering::Relaxed),
            poll_scans: self.poll_scans.load(Ordering::Relaxed),
            steps_run: self.steps_run.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            split_secs: secs(&self.split_us),
            dispatch_secs: secs(&self.dispatch_us),
            wait_secs: secs(&self.wait_us),
            aggregate_secs: secs(&self.aggregate_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_written: u64,
    pub records_written: u64,
    pub scripts_built: u64,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_degraded: u64,
    pub poll_scans: u64,
    pub steps_run: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub split_secs: f64,
    pub dispatch_secs: f64,
    pub wait_secs: f64,
    pub aggregate_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} ({} records) | Jobs: {} submitted, {} done, {} failed, {} degraded | \
             Scans: {} | Steps: {} | Elapsed: {:.1}s",
            self.chunks_written,
            self.records_written,
            self.jobs_submitted,
            self.jobs_completed,
            self.jobs_failed,
            self.jobs_degraded,
            self.poll_scans,
            self.steps_run,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress reporter for local job pools.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_jobs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_jobs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_jobs,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_jobs > 0 {
                        (snapshot.jobs_completed + snapshot.jobs_failed) as f64
                            / self.total_jobs as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Run Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!(
            "Chunks written: {} ({} records)",
            snapshot.chunks_written, snapshot.records_written
        );
        println!("Scripts built: {}", snapshot.scripts_built);
        println!("Jobs submitted: {}", snapshot.jobs_submitted);
        println!("Jobs done: {}", snapshot.jobs_completed);
        println!("Jobs failed: {}", snapshot.jobs_failed);
        if snapshot.jobs_degraded > 0 {
            println!("Jobs recorded for manual replay: {}", snapshot.jobs_degraded);
        }
        println!("Downstream steps: {}", snapshot.steps_run);

        let total = snapshot.split_secs
            + snapshot.dispatch_secs
            + snapshot.wait_secs
            + snapshot.aggregate_secs;
        if total > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Split:     {:>9.1}s ({:>5.1}%)", snapshot.split_secs, snapshot.split_secs / total * 100.0);
            println!("Dispatch:  {:>9.1}s ({:>5.1}%)", snapshot.dispatch_secs, snapshot.dispatch_secs / total * 100.0);
            println!("Wait:      {:>9.1}s ({:>5.1}%)", snapshot.wait_secs, snapshot.wait_secs / total * 100.0);
            println!("Aggregate: {:>9.1}s ({:>5.1}%)", snapshot.aggregate_secs, snapshot.aggregate_secs / total * 100.0);
        }
        println!("===================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_counters() {
        let metrics = Metrics::new();

        metrics.add_chunk_written(250);
        metrics.add_chunk_written(100);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_written, 2);
        assert_eq!(snapshot.records_written, 350);
    }

    #[test]
    fn test_all_counters() {
        let metrics = Metrics::new();

        metrics.add_script_built();
        metrics.add_job_submitted();
        metrics.add_job_submitted();
        metrics.add_job_completed();
        metrics.add_job_failed();
        metrics.add_job_degraded();
        metrics.add_poll_scan();
        metrics.add_step_run();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scripts_built, 1);
        assert_eq!(snapshot.jobs_submitted, 2);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_degraded, 1);
        assert_eq!(snapshot.poll_scans, 1);
        assert_eq!(snapshot.steps_run, 1);

        metrics.set_jobs_completed(7);
        assert_eq!(metrics.snapshot().jobs_completed, 7);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_split_time(Duration::from_millis(100));
        metrics.add_dispatch_time(Duration::from_millis(50));
        metrics.add_wait_time(Duration::from_millis(25));
        metrics.add_aggregate_time(Duration::from_millis(75));

        let snapshot = metrics.snapshot();

        assert!((snapshot.split_secs - 0.1).abs() < 0.001);
        assert!((snapshot.dispatch_secs - 0.05).abs() < 0.001);
        assert!((snapshot.wait_secs - 0.025).abs() < 0.001);
        assert!((snapshot.aggregate_secs - 0.075).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_chunk_written(10);
        metrics.add_job_submitted();

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("Chunks: 1 (10 records)"));
        assert!(display.contains("1 submitted"));
    }

    #[test]
    fn test_zero_elapsed_without_start() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        assert_eq!(metrics.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_metrics_reporter_new() {
        let metrics = Metrics::new();
        let reporter = MetricsReporter::new(metrics, 10, 1000);

        assert_eq!(reporter.interval_secs, 10);
        assert_eq!(reporter.total_jobs, 1000);
    }
}
