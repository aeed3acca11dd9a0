//! Completion polling.
//!
//! Jobs report completion by touching a sentinel file. The poller rechecks
//! only the still-pending sentinels on every tick, and at the target's
//! interval rescans the whole set from disk as the authoritative count.

use crate::chunk::JobChunk;
use crate::error::{Result, SchedulerError};
use crate::io::RunManifest;
use crate::pipeline::Metrics;
use crate::target::QueueProfile;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of completion signals for job chunks.
///
/// The default implementation stats sentinel files; an event-driven watcher
/// can replace it without touching the polling loop.
#[async_trait]
pub trait CompletionWatcher: Send + Sync {
    /// Whether the chunk's job has finished.
    fn is_done(&self, chunk: &JobChunk) -> bool;

    /// Block until the next check is due.
    async fn wait(&self, tick: Duration) {
        tokio::time::sleep(tick).await;
    }
}

/// Checks for sentinel files on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentinelWatcher;

#[async_trait]
impl CompletionWatcher for SentinelWatcher {
    fn is_done(&self, chunk: &JobChunk) -> bool {
        chunk.is_done()
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every sentinel is present
    Done { elapsed: Duration, scans: u64 },
    /// The run was degraded and nothing was polled
    ShortCircuited { reason: String },
}

/// Waits until every chunk's job has reported completion.
pub struct CompletionPoller {
    watcher: Arc<dyn CompletionWatcher>,
    tick: Duration,
    timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl CompletionPoller {
    pub fn new(
        watcher: Arc<dyn CompletionWatcher>,
        tick: Duration,
        timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            watcher,
            tick,
            timeout,
            metrics,
        }
    }

    /// Chunks whose sentinel is missing, in index order.
    fn scan<'a>(&self, chunks: &'a [JobChunk]) -> Vec<&'a JobChunk> {
        self.metrics.add_poll_scan();
        chunks.iter().filter(|c| !self.watcher.is_done(c)).collect()
    }

    /// Wait for the jobs of a dispatched run, unless it was degraded.
    pub async fn await_run(&self, manifest: &RunManifest) -> Result<PollOutcome> {
        if let Some(reason) = &manifest.degraded {
            tracing::info!("Run is degraded, not polling: {}", reason);
            return Ok(PollOutcome::ShortCircuited {
                reason: reason.clone(),
            });
        }
        self.await_all(&manifest.job_chunks(), &manifest.queue).await
    }

    /// Wait until every chunk's sentinel exists.
    pub async fn await_all(&self, chunks: &[JobChunk], profile: &QueueProfile) -> Result<PollOutcome> {
        let start = Instant::now();
        let total = chunks.len();
        let mut scans = 1;
        let mut pending = self.scan(chunks);

        if pending.is_empty() {
            self.metrics.set_jobs_completed(total as u64);
            return Ok(PollOutcome::Done {
                elapsed: start.elapsed(),
                scans,
            });
        }

        let interval = Duration::from_secs(profile.poll_interval_secs.max(1));
        tracing::info!(
            "Waiting on {}/{} jobs (queue {}, full scan every {}s)",
            pending.len(),
            total,
            profile.queue_name,
            interval.as_secs()
        );

        let mut last_scan = Instant::now();
        loop {
            self.watcher.wait(self.tick).await;
            pending.retain(|chunk| !self.watcher.is_done(chunk));

            // A cleared pending list is confirmed by a full scan before returning.
            if pending.is_empty() || last_scan.elapsed() >= interval {
                pending = self.scan(chunks);
                scans += 1;
                last_scan = Instant::now();

                let done = total - pending.len();
                self.metrics.set_jobs_completed(done as u64);
                tracing::info!(
                    "[{:.1}%] {}/{} jobs done, {:.0}s elapsed",
                    done as f64 / total as f64 * 100.0,
                    done,
                    total,
                    start.elapsed().as_secs_f64()
                );

                if pending.is_empty() {
                    let elapsed = start.elapsed();
                    self.metrics.add_wait_time(elapsed);
                    return Ok(PollOutcome::Done { elapsed, scans });
                }
            }

            if let Some(limit) = self.timeout {
                if start.elapsed() >= limit {
                    self.metrics.add_wait_time(start.elapsed());
                    return Err(SchedulerError::WaitTimeout {
                        pending: pending.iter().map(|c| c.index).collect(),
                        waited_secs: start.elapsed().as_secs(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOutputs;
    use crate::config::ResultFormat;
    use crate::io::WorkLayout;
    use crate::target::ReferenceTarget;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn chunks(layout: &WorkLayout, n: usize) -> Vec<JobChunk> {
        (1..=n)
            .map(|i| JobChunk {
                index: i,
                record_count: 1,
                input_path: layout.chunk_input(i),
                script_path: layout.chunk_script(i),
                sentinel_path: layout.chunk_sentinel(i),
                outputs: ChunkOutputs {
                    archive: layout.chunk_archive(i),
                    result: layout.chunk_result(i),
                },
            })
            .collect()
    }

    fn profile() -> QueueProfile {
        QueueProfile {
            queue_name: "all.q".to_string(),
            poll_interval_secs: 60,
        }
    }

    /// Completes one more chunk on every wait and counts checks.
    #[derive(Default)]
    struct StepWatcher {
        done: Mutex<HashSet<usize>>,
        next: AtomicUsize,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl CompletionWatcher for StepWatcher {
        fn is_done(&self, chunk: &JobChunk) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.done.lock().unwrap().contains(&chunk.index)
        }

        async fn wait(&self, _tick: Duration) {
            let next = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            self.done.lock().unwrap().insert(next);
        }
    }

    #[tokio::test]
    async fn test_all_done_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = chunks(&layout, 3);
        for chunk in &chunks {
            std::fs::write(&chunk.sentinel_path, "").unwrap();
        }
        let poller = CompletionPoller::new(
            Arc::new(SentinelWatcher),
            Duration::from_secs(3600),
            None,
            Metrics::new(),
        );

        let first = poller.await_all(&chunks, &profile()).await.unwrap();
        let second = poller.await_all(&chunks, &profile()).await.unwrap();

        assert!(matches!(first, PollOutcome::Done { scans: 1, .. }));
        assert!(matches!(second, PollOutcome::Done { scans: 1, .. }));
        // Polling reads only; nothing new in the run directory
        assert_eq!(std::fs::read_dir(layout.tmp_dir()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_waits_until_every_chunk_done() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        let chunks = chunks(&layout, 4);
        let watcher = Arc::new(StepWatcher::default());
        let metrics = Metrics::new();
        let poller = CompletionPoller::new(watcher.clone(), Duration::ZERO, None, metrics.clone());

        let outcome = poller.await_all(&chunks, &profile()).await.unwrap();

        assert!(matches!(outcome, PollOutcome::Done { scans: 2, .. }));
        assert_eq!(watcher.next.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.snapshot().jobs_completed, 4);
    }

    #[tokio::test]
    async fn test_sentinels_appear_while_polling() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = chunks(&layout, 2);
        let sentinels: Vec<_> = chunks.iter().map(|c| c.sentinel_path.clone()).collect();
        let poller = CompletionPoller::new(
            Arc::new(SentinelWatcher),
            Duration::from_millis(10),
            Some(Duration::from_secs(30)),
            Metrics::new(),
        );

        let writer = tokio::spawn(async move {
            for path in sentinels {
                tokio::time::sleep(Duration::from_millis(30)).await;
                std::fs::write(path, "").unwrap();
            }
        });
        let outcome = poller.await_all(&chunks, &profile()).await.unwrap();
        writer.await.unwrap();

        assert!(matches!(outcome, PollOutcome::Done { .. }));
    }

    #[tokio::test]
    async fn test_timeout_reports_pending_chunks() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = chunks(&layout, 3);
        std::fs::write(&chunks[1].sentinel_path, "").unwrap();
        let poller = CompletionPoller::new(
            Arc::new(SentinelWatcher),
            Duration::from_millis(5),
            Some(Duration::from_millis(20)),
            Metrics::new(),
        );

        let err = poller.await_all(&chunks, &profile()).await.unwrap_err();

        match err {
            SchedulerError::WaitTimeout { pending, .. } => assert_eq!(pending, vec![1, 3]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_degraded_run_is_not_polled() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = chunks(&layout, 2);
        let mut manifest = RunManifest::new(&layout, ReferenceTarget::Silva, profile(), 2, &chunks);
        manifest.degrade("queue all.q unreachable");
        let watcher = Arc::new(StepWatcher::default());
        let poller = CompletionPoller::new(watcher.clone(), Duration::ZERO, None, Metrics::new());

        let outcome = poller.await_run(&manifest).await.unwrap();

        assert!(matches!(outcome, PollOutcome::ShortCircuited { .. }));
        assert_eq!(watcher.checks.load(Ordering::SeqCst), 0);
    }
}
