//! Run manifest and replay recipe.
//!
//! The manifest records every chunk, whether it was dispatched, and each
//! command the run issued. Recipe lines are appended to the recipe file as
//! they are recorded so an operator can replay a run by hand even if the
//! process dies before the manifest is saved.
//!
//! The recipe keeps every issued command. After a degraded run the replay
//! file holds only the commands of chunks the queue never accepted.

use crate::chunk::{JobChunk, JobStatus};
use crate::error::{Result, SchedulerError};
use crate::io::WorkLayout;
use crate::target::{QueueProfile, ReferenceTarget};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A chunk and whether it has been dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEntry {
    #[serde(flatten)]
    pub chunk: JobChunk,
    pub submitted: bool,

    /// Command recorded for this chunk
    #[serde(default)]
    pub command: Option<String>,
}

/// Persistent record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub target: ReferenceTarget,
    pub queue: QueueProfile,
    pub input_records: usize,
    pub chunks: Vec<ChunkEntry>,
    pub recipe: Vec<String>,
    #[serde(default)]
    pub degraded: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,

    #[serde(skip)]
    recipe_path: PathBuf,
    #[serde(skip)]
    manifest_path: PathBuf,
}

impl RunManifest {
    pub fn new(
        layout: &WorkLayout,
        target: ReferenceTarget,
        queue: QueueProfile,
        input_records: usize,
        chunks: &[JobChunk],
    ) -> Self {
        Self {
            target,
            queue,
            input_records,
            chunks: chunks
                .iter()
                .map(|chunk| ChunkEntry {
                    chunk: chunk.clone(),
                    submitted: false,
                    command: None,
                })
                .collect(),
            recipe: Vec::new(),
            degraded: None,
            outcome: None,
            recipe_path: layout.recipe(),
            manifest_path: layout.manifest(),
        }
    }

    /// Load a saved manifest from a run directory.
    pub fn load(layout: &WorkLayout) -> Result<Self> {
        let path = layout.manifest();
        let text = std::fs::read_to_string(&path).map_err(|e| SchedulerError::io(&path, e))?;
        let mut manifest: RunManifest = serde_json::from_str(&text)
            .map_err(|e| SchedulerError::Manifest(format!("{}: {}", path.display(), e)))?;
        manifest.recipe_path = layout.recipe();
        manifest.manifest_path = path;
        Ok(manifest)
    }

    /// Write the manifest as pretty JSON.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SchedulerError::Manifest(e.to_string()))?;
        std::fs::write(&self.manifest_path, json)
            .map_err(|e| SchedulerError::io(&self.manifest_path, e))
    }

    pub fn path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn recipe_path(&self) -> &Path {
        &self.recipe_path
    }

    /// The chunks in index order.
    pub fn job_chunks(&self) -> Vec<JobChunk> {
        self.chunks.iter().map(|e| e.chunk.clone()).collect()
    }

    /// Append one line to the recipe, both in memory and on disk.
    pub fn append_recipe(&mut self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.recipe_path)
            .map_err(|e| SchedulerError::io(&self.recipe_path, e))?;
        writeln!(file, "{}", line).map_err(|e| SchedulerError::io(&self.recipe_path, e))?;
        self.recipe.push(line);
        Ok(())
    }

    /// Record the command that dispatches chunk `index`.
    pub fn record_command(&mut self, index: usize, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        self.append_recipe(line.clone())?;
        if let Some(entry) = self.chunks.iter_mut().find(|e| e.chunk.index == index) {
            entry.command = Some(line);
        }
        Ok(())
    }

    /// Write the commands of every chunk not yet accepted to `path`,
    /// replacing any earlier replay file. Returns how many were written.
    pub fn write_replay(&self, path: &Path) -> Result<usize> {
        let pending: Vec<&str> = self
            .chunks
            .iter()
            .filter(|e| !e.submitted)
            .filter_map(|e| e.command.as_deref())
            .collect();
        let mut text = pending.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(path, text).map_err(|e| SchedulerError::io(path, e))?;
        Ok(pending.len())
    }

    pub fn mark_submitted(&mut self, index: usize) {
        if let Some(entry) = self.chunks.iter_mut().find(|e| e.chunk.index == index) {
            entry.submitted = true;
        }
    }

    /// Mark the run as degraded; the first reason wins.
    pub fn degrade(&mut self, reason: impl Into<String>) {
        if self.degraded.is_none() {
            self.degraded = Some(reason.into());
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn finalize(&mut self, outcome: impl Into<String>) -> Result<()> {
        self.outcome = Some(outcome.into());
        self.save()
    }

    /// Current status of every chunk, observed from disk.
    pub fn statuses(&self) -> Vec<(usize, JobStatus)> {
        self.chunks
            .iter()
            .map(|e| (e.chunk.index, JobStatus::observe(&e.chunk, e.submitted)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOutputs;
    use crate::config::ResultFormat;
    use tempfile::TempDir;

    fn chunk(layout: &WorkLayout, index: usize) -> JobChunk {
        JobChunk {
            index,
            record_count: 1,
            input_path: layout.chunk_input(index),
            script_path: layout.chunk_script(index),
            sentinel_path: layout.chunk_sentinel(index),
            outputs: ChunkOutputs {
                archive: layout.chunk_archive(index),
                result: layout.chunk_result(index),
            },
        }
    }

    fn profile() -> QueueProfile {
        QueueProfile {
            queue_name: "all.q".to_string(),
            poll_interval_secs: 60,
        }
    }

    #[test]
    fn test_recipe_is_appended_to_disk() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = vec![chunk(&layout, 1)];
        let mut manifest =
            RunManifest::new(&layout, ReferenceTarget::Silva, profile(), 1, &chunks);

        manifest.append_recipe("qsub -q all.q a.sh").unwrap();
        manifest.append_recipe("qsub -q all.q b.sh").unwrap();

        let text = std::fs::read_to_string(layout.recipe()).unwrap();
        assert_eq!(text, "qsub -q all.q a.sh\nqsub -q all.q b.sh\n");
        assert_eq!(manifest.recipe.len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = vec![chunk(&layout, 1), chunk(&layout, 2)];
        let mut manifest =
            RunManifest::new(&layout, ReferenceTarget::NcbiNt, profile(), 2, &chunks);
        manifest.mark_submitted(2);
        manifest.degrade("queue down");
        manifest.degrade("ignored");
        manifest.save().unwrap();

        let loaded = RunManifest::load(&layout).unwrap();
        assert_eq!(loaded.target, ReferenceTarget::NcbiNt);
        assert_eq!(loaded.chunks.len(), 2);
        assert!(!loaded.chunks[0].submitted);
        assert!(loaded.chunks[1].submitted);
        assert_eq!(loaded.degraded.as_deref(), Some("queue down"));
        assert_eq!(loaded.recipe_path(), layout.recipe().as_path());
    }

    #[test]
    fn test_replay_skips_accepted_chunks() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = vec![chunk(&layout, 1), chunk(&layout, 2), chunk(&layout, 3)];
        let mut manifest =
            RunManifest::new(&layout, ReferenceTarget::Silva, profile(), 3, &chunks);
        for index in 1..=3 {
            manifest
                .record_command(index, format!("qsub -N blast_{} s{}.sh", index, index))
                .unwrap();
        }
        manifest.mark_submitted(1);

        let written = manifest.write_replay(&layout.replay()).unwrap();

        assert_eq!(written, 2);
        let replay = std::fs::read_to_string(layout.replay()).unwrap();
        assert_eq!(replay, "qsub -N blast_2 s2.sh\nqsub -N blast_3 s3.sh\n");
        let recipe = std::fs::read_to_string(layout.recipe()).unwrap();
        assert_eq!(recipe.lines().count(), 3);
    }

    #[test]
    fn test_statuses_follow_sentinels() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunks = vec![chunk(&layout, 1), chunk(&layout, 2), chunk(&layout, 3)];
        let mut manifest =
            RunManifest::new(&layout, ReferenceTarget::Silva, profile(), 3, &chunks);
        manifest.mark_submitted(1);
        manifest.mark_submitted(2);
        std::fs::write(layout.chunk_sentinel(2), "").unwrap();

        assert_eq!(
            manifest.statuses(),
            vec![
                (1, JobStatus::Submitted),
                (2, JobStatus::Done),
                (3, JobStatus::Pending),
            ]
        );
    }
}
