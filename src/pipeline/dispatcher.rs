//! Job submission.
//!
//! In queue mode each script is handed to the queue client and the exact
//! submission command goes to the recipe, whether or not the queue takes it.
//! If the queue cannot be reached the run degrades: remaining submissions
//! are recorded but not sent, and polling is skipped.
//!
//! In local mode scripts run as child processes and completion is observed
//! from their exit status.

use crate::chunk::JobChunk;
use crate::config::DispatchMode;
use crate::error::{Result, SchedulerError};
use crate::io::{RunManifest, WorkLayout};
use crate::job::CommandSpec;
use crate::pipeline::queue::{QueueAvailability, QueueClient};
use crate::pipeline::Metrics;
use crate::target::QueueProfile;
use futures::stream::{self, StreamExt};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Outcome of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    /// Queue accepted the job; `ack` is the client's reply
    Submitted { ack: String },
    /// Local job ran to completion
    Completed { exit_code: Option<i32> },
    /// Recorded to the recipe only
    Degraded { reason: String },
}

/// Exit status of one local job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalJobExit {
    pub index: usize,
    pub exit_code: Option<i32>,
}

impl LocalJobExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Sends job scripts to the queue or runs them locally.
pub struct Dispatcher {
    mode: DispatchMode,
    client: Arc<dyn QueueClient>,
    layout: Arc<WorkLayout>,
    metrics: Arc<Metrics>,
    local_workers: usize,
    availability: Option<QueueAvailability>,
}

impl Dispatcher {
    pub fn new(
        mode: DispatchMode,
        client: Arc<dyn QueueClient>,
        layout: Arc<WorkLayout>,
        metrics: Arc<Metrics>,
        local_workers: usize,
    ) -> Self {
        Self {
            mode,
            client,
            layout,
            metrics,
            local_workers: local_workers.max(1),
            availability: None,
        }
    }

    /// Probe the queue once per dispatcher and reuse the answer.
    async fn availability(&mut self, queue: &str) -> QueueAvailability {
        if let Some(known) = &self.availability {
            return known.clone();
        }
        let probed = self.client.probe(queue).await;
        if let Some(node) = probed.node.as_deref().filter(|_| probed.available) {
            tracing::info!("Queue {} available, first usable node {}", queue, node);
        }
        self.availability = Some(probed.clone());
        probed
    }

    /// Submit one chunk's script.
    pub async fn submit(
        &mut self,
        chunk: &JobChunk,
        profile: &QueueProfile,
        manifest: &mut RunManifest,
    ) -> Result<SubmissionResult> {
        match self.mode {
            DispatchMode::Queue => self.submit_queue(chunk, profile, manifest).await,
            DispatchMode::Local => {
                let command = local_command(&chunk.script_path);
                manifest.record_command(chunk.index, command.render())?;
                manifest.mark_submitted(chunk.index);
                let exit = self.execute_local(chunk).await?;
                Ok(SubmissionResult::Completed {
                    exit_code: exit.exit_code,
                })
            }
        }
    }

    async fn submit_queue(
        &mut self,
        chunk: &JobChunk,
        profile: &QueueProfile,
        manifest: &mut RunManifest,
    ) -> Result<SubmissionResult> {
        let command = self.client.submit_command(
            &chunk.script_path,
            &self.layout.job_name(chunk.index),
            &profile.queue_name,
        );
        manifest.record_command(chunk.index, command.render())?;

        if let Some(reason) = manifest.degraded.clone() {
            self.metrics.add_job_degraded();
            return Ok(SubmissionResult::Degraded { reason });
        }

        let availability = self.availability(&profile.queue_name).await;
        if !availability.available {
            let reason = format!("queue {} unreachable: {}", profile.queue_name, availability.detail);
            tracing::warn!("{}; recording submissions for manual replay", reason);
            manifest.degrade(reason.clone());
            self.metrics.add_job_degraded();
            return Ok(SubmissionResult::Degraded { reason });
        }

        let output = self.client.run(&command).await;
        let reason = match output {
            Ok(out) => {
                self.capture(&out.stdout, &out.stderr)?;
                if out.status.success() {
                    manifest.mark_submitted(chunk.index);
                    self.metrics.add_job_submitted();
                    let ack = String::from_utf8_lossy(&out.stdout).trim().to_string();
                    tracing::debug!("Chunk {} submitted: {}", chunk.index, ack);
                    return Ok(SubmissionResult::Submitted { ack });
                }
                format!(
                    "submission of chunk {} rejected ({}): {}",
                    chunk.index,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                )
            }
            Err(e) => format!("cannot run {}: {}", command.program, e),
        };

        tracing::warn!("{}; recording remaining submissions for manual replay", reason);
        manifest.degrade(reason.clone());
        self.metrics.add_job_degraded();
        Ok(SubmissionResult::Degraded { reason })
    }

    /// Append submission output to the queue capture files.
    fn capture(&self, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        append(&self.layout.queue_log(), stdout)?;
        append(&self.layout.queue_err(), stderr)
    }

    /// Run one chunk's script to completion.
    async fn execute_local(&self, chunk: &JobChunk) -> Result<LocalJobExit> {
        self.metrics.add_job_submitted();
        let output = local_command(&chunk.script_path)
            .output()
            .await
            .map_err(|e| SchedulerError::io(&chunk.script_path, e))?;

        let exit = LocalJobExit {
            index: chunk.index,
            exit_code: output.status.code(),
        };
        if exit.success() {
            self.metrics.add_job_completed();
        } else {
            self.metrics.add_job_failed();
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                "Chunk {} exited with {:?}: {}",
                chunk.index,
                exit.exit_code,
                stderr.lines().last().unwrap_or("")
            );
        }
        Ok(exit)
    }

    /// Run every chunk locally with at most `local_workers` at a time.
    ///
    /// All jobs run even if some fail; failures are reported together.
    pub async fn run_local_pool(
        &self,
        chunks: &[JobChunk],
        manifest: &mut RunManifest,
    ) -> Result<Vec<LocalJobExit>> {
        for chunk in chunks {
            manifest.record_command(chunk.index, local_command(&chunk.script_path).render())?;
            manifest.mark_submitted(chunk.index);
        }

        tracing::info!(
            "Running {} jobs locally ({} concurrent)",
            chunks.len(),
            self.local_workers
        );

        let results: Vec<Result<LocalJobExit>> = stream::iter(chunks)
            .map(|chunk| self.execute_local(chunk))
            .buffer_unordered(self.local_workers)
            .collect()
            .await;

        let mut exits = results.into_iter().collect::<Result<Vec<_>>>()?;
        exits.sort_by_key(|e| e.index);

        let failed: Vec<usize> = exits.iter().filter(|e| !e.success()).map(|e| e.index).collect();
        if !failed.is_empty() {
            return Err(SchedulerError::LocalJobFailed { failed });
        }
        Ok(exits)
    }
}

fn local_command(script: &Path) -> CommandSpec {
    CommandSpec::new("bash").arg(script.display().to_string())
}

fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SchedulerError::io(path, e))?;
    file.write_all(bytes).map_err(|e| SchedulerError::io(path, e))
}
