//! Run directory layout.
//!
//! ```text
//! {dir}/
//!   {prefix}_tmp/query.fasta_<n>            per-chunk input
//!   {prefix}_tmp/query.fasta_<n>.sh         per-chunk job script
//!   {prefix}_tmp/query.fasta_<n>.sh.done    sentinel
//!   {prefix}_archive/Job_query.fasta_<n>.archive
//!   {prefix}_result/Job_query.fasta_<n>.blast   (or {prefix}_xml/..xml)
//!   {prefix}_merged.<ext>
//!   qsub.log, qsub.err, qsub_{prefix}.recipe, qsub_{prefix}.replay
//!   db_version.txt, run_manifest.json
//! ```
//!
//! Every per-chunk path is derived from the chunk index, so chunks never
//! share a file within a run.

use crate::config::{Config, ResultFormat};
use crate::error::{Result, SchedulerError};
use crate::target::ReferenceTarget;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const CHUNK_STEM: &str = "query.fasta";

/// Paths used by one run.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
    prefix: String,
    format: ResultFormat,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>, format: ResultFormat) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            format,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.output.dir.clone(),
            config.output.prefix.clone(),
            config.converter.format,
        )
    }

    /// Create the run directories. Existing directories are reused; per-chunk
    /// collisions are caught when chunk files are created.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.tmp_dir(), self.archive_dir(), self.result_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| SchedulerError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(format!("{}_tmp", self.prefix))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(format!("{}_archive", self.prefix))
    }

    pub fn result_dir(&self) -> PathBuf {
        match self.format {
            ResultFormat::Tabular => self.root.join(format!("{}_result", self.prefix)),
            ResultFormat::Xml => self.root.join(format!("{}_xml", self.prefix)),
        }
    }

    fn result_ext(&self) -> &'static str {
        match self.format {
            ResultFormat::Tabular => "blast",
            ResultFormat::Xml => "xml",
        }
    }

    pub fn chunk_input(&self, index: usize) -> PathBuf {
        self.tmp_dir().join(format!("{}_{}", CHUNK_STEM, index))
    }

    pub fn chunk_script(&self, index: usize) -> PathBuf {
        self.tmp_dir().join(format!("{}_{}.sh", CHUNK_STEM, index))
    }

    pub fn chunk_sentinel(&self, index: usize) -> PathBuf {
        self.tmp_dir().join(format!("{}_{}.sh.done", CHUNK_STEM, index))
    }

    pub fn chunk_archive(&self, index: usize) -> PathBuf {
        self.archive_dir()
            .join(format!("Job_{}_{}.archive", CHUNK_STEM, index))
    }

    pub fn chunk_result(&self, index: usize) -> PathBuf {
        self.result_dir().join(format!(
            "Job_{}_{}.{}",
            CHUNK_STEM,
            index,
            self.result_ext()
        ))
    }

    /// Grid job name for a chunk.
    pub fn job_name(&self, index: usize) -> String {
        format!("{}_{}", self.prefix, index)
    }

    pub fn merged_result(&self) -> PathBuf {
        self.root
            .join(format!("{}_merged.{}", self.prefix, self.result_ext()))
    }

    pub fn queue_log(&self) -> PathBuf {
        self.root.join("qsub.log")
    }

    pub fn queue_err(&self) -> PathBuf {
        self.root.join("qsub.err")
    }

    pub fn recipe(&self) -> PathBuf {
        self.root.join(format!("qsub_{}.recipe", self.prefix))
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("run_manifest.json")
    }

    pub fn replay(&self) -> PathBuf {
        self.root.join(format!("qsub_{}.replay", self.prefix))
    }

    pub fn db_version(&self) -> PathBuf {
        self.root.join("db_version.txt")
    }

    /// Record which reference target and database the run searched.
    ///
    /// Fails if the file exists: it belongs to an earlier run.
    pub fn write_db_version(&self, target: ReferenceTarget, database: &str) -> Result<()> {
        let modified = std::fs::metadata(database)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let contents = format!(
            "target\t{}\ndatabase\t{}\nmodified_epoch_secs\t{}\n",
            target, database, modified
        );
        let path = self.db_version();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| SchedulerError::io(&path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| SchedulerError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunk_paths() {
        let layout = WorkLayout::new("/run", "blast", ResultFormat::Tabular);
        assert_eq!(
            layout.chunk_input(3),
            PathBuf::from("/run/blast_tmp/query.fasta_3")
        );
        assert_eq!(
            layout.chunk_sentinel(3),
            PathBuf::from("/run/blast_tmp/query.fasta_3.sh.done")
        );
        assert_eq!(
            layout.chunk_archive(3),
            PathBuf::from("/run/blast_archive/Job_query.fasta_3.archive")
        );
        assert_eq!(
            layout.chunk_result(3),
            PathBuf::from("/run/blast_result/Job_query.fasta_3.blast")
        );
        assert_eq!(layout.recipe(), PathBuf::from("/run/qsub_blast.recipe"));
        assert_eq!(layout.replay(), PathBuf::from("/run/qsub_blast.replay"));
    }

    #[test]
    fn test_xml_layout() {
        let layout = WorkLayout::new("/run", "blast", ResultFormat::Xml);
        assert_eq!(
            layout.chunk_result(1),
            PathBuf::from("/run/blast_xml/Job_query.fasta_1.xml")
        );
        assert_eq!(layout.merged_result(), PathBuf::from("/run/blast_merged.xml"));
    }

    #[test]
    fn test_db_version_written() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        layout
            .write_db_version(ReferenceTarget::Silva, "/nonexistent/db")
            .unwrap();

        let text = std::fs::read_to_string(layout.db_version()).unwrap();
        assert!(text.contains("target\tSILVA"));
        assert!(text.contains("modified_epoch_secs\tunknown"));
        assert!(layout.tmp_dir().is_dir());

        // A second run never replaces the first run's record
        assert!(layout.write_db_version(ReferenceTarget::NcbiNt, "/db/nt").is_err());
        assert_eq!(std::fs::read_to_string(layout.db_version()).unwrap(), text);
    }
}
