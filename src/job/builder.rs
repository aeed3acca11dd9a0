//! Per-chunk job scripts.
//!
//! A script aligns its chunk, converts the archive, then touches the
//! sentinel. The steps are chained with `&&`, so the sentinel appears only
//! when both tools exit zero and the script exits with the failing status
//! otherwise.

use crate::chunk::{create_new, JobChunk};
use crate::config::{Config, TargetConfig, ToolConfig};
use crate::error::{Result, SchedulerError};
use crate::job::{CommandSpec, TemplateVars};
use crate::pipeline::Metrics;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Writes job scripts for chunks.
pub struct JobBuilder {
    aligner: ToolConfig,
    converter: ToolConfig,
    threads: usize,
    metrics: Arc<Metrics>,
}

impl JobBuilder {
    pub fn new(aligner: ToolConfig, converter: ToolConfig, threads: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            aligner,
            converter,
            threads,
            metrics,
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(
            config.aligner.clone(),
            ToolConfig {
                program: config.converter.program.clone(),
                args: config.converter.args.clone(),
            },
            config.jobs.threads,
            metrics,
        )
    }

    fn vars(&self, chunk: &JobChunk, target: &TargetConfig) -> TemplateVars {
        TemplateVars::new()
            .set("input", chunk.input_path.display().to_string())
            .set("reference", target.database.clone())
            .set("archive", chunk.outputs.archive.display().to_string())
            .set("result", chunk.outputs.result.display().to_string())
            .set("index", chunk.index.to_string())
            .set("threads", self.threads.to_string())
    }

    /// The alignment and conversion commands for a chunk.
    pub fn commands(&self, chunk: &JobChunk, target: &TargetConfig) -> (CommandSpec, CommandSpec) {
        let vars = self.vars(chunk, target);
        (
            CommandSpec::from_tool(&self.aligner, &vars),
            CommandSpec::from_tool(&self.converter, &vars),
        )
    }

    /// Script text for a chunk.
    pub fn script_text(&self, chunk: &JobChunk, target: &TargetConfig) -> String {
        let (align, convert) = self.commands(chunk, target);
        let touch = CommandSpec::new("touch").arg(chunk.sentinel_path.display().to_string());
        format!(
            "#!/bin/bash\n\
             # chunk {index}: {records} records against {target}\n\
             set -euo pipefail\n\
             {align} \\\n  && {convert} \\\n  && {touch}\n",
            index = chunk.index,
            records = chunk.record_count,
            target = target.kind,
            align = align.render(),
            convert = convert.render(),
            touch = touch.render(),
        )
    }

    /// Write the chunk's script and return its path.
    ///
    /// Fails if a script or sentinel for this index already exists.
    pub fn build(&self, chunk: &JobChunk, target: &TargetConfig) -> Result<PathBuf> {
        if chunk.sentinel_path.exists() {
            return Err(SchedulerError::ScriptCollision {
                index: chunk.index,
                path: chunk.sentinel_path.clone(),
            });
        }

        let path = chunk.script_path.clone();
        let mut file = create_new(&path, chunk.index)?;
        file.write_all(self.script_text(chunk, target).as_bytes())
            .map_err(|e| SchedulerError::io(&path, e))?;
        drop(file);
        make_executable(&path)?;

        self.metrics.add_script_built();
        tracing::debug!("Wrote job script {}", path.display());
        Ok(path)
    }
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| SchedulerError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOutputs;
    use crate::config::ResultFormat;
    use crate::io::WorkLayout;
    use crate::target::ReferenceTarget;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (JobBuilder, JobChunk, TargetConfig) {
        let layout = WorkLayout::new(dir.path(), "blast", ResultFormat::Tabular);
        layout.create_dirs().unwrap();
        let chunk = JobChunk {
            index: 2,
            record_count: 10,
            input_path: layout.chunk_input(2),
            script_path: layout.chunk_script(2),
            sentinel_path: layout.chunk_sentinel(2),
            outputs: ChunkOutputs {
                archive: layout.chunk_archive(2),
                result: layout.chunk_result(2),
            },
        };
        let aligner = ToolConfig {
            program: "blastn".to_string(),
            args: ["-query", "{input}", "-db", "{reference}", "-out", "{archive}", "-num_threads", "{threads}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let converter = ToolConfig {
            program: "blast_formatter".to_string(),
            args: ["-archive", "{archive}", "-outfmt", "6 qseqid sseqid", "-out", "{result}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let target = TargetConfig {
            kind: ReferenceTarget::Silva,
            database: "/db/silva".to_string(),
            taxonomy: None,
        };
        (JobBuilder::new(aligner, converter, 4, Metrics::new()), chunk, target)
    }

    #[test]
    fn test_script_orders_steps() {
        let dir = TempDir::new().unwrap();
        let (builder, chunk, target) = setup(&dir);

        let text = builder.script_text(&chunk, &target);

        let align = text.find("blastn -query").unwrap();
        let convert = text.find("&& blast_formatter").unwrap();
        let touch = text.find("&& touch").unwrap();
        assert!(align < convert && convert < touch);
        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("\nset -euo pipefail\n"));
        assert!(text.contains("-db /db/silva"));
        assert!(text.contains("-num_threads 4"));
        assert!(text.contains("'6 qseqid sseqid'"));
        assert!(text.contains("query.fasta_2.sh.done"));
    }

    #[test]
    fn test_build_writes_executable_script() {
        let dir = TempDir::new().unwrap();
        let (builder, chunk, target) = setup(&dir);

        let path = builder.build(&chunk, &target).unwrap();

        assert_eq!(path, chunk.script_path);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, builder.script_text(&chunk, &target));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_existing_script_collides() {
        let dir = TempDir::new().unwrap();
        let (builder, chunk, target) = setup(&dir);
        builder.build(&chunk, &target).unwrap();

        let err = builder.build(&chunk, &target).unwrap_err();

        assert!(matches!(err, SchedulerError::ScriptCollision { index: 2, .. }));
    }

    #[test]
    fn test_existing_sentinel_collides() {
        let dir = TempDir::new().unwrap();
        let (builder, chunk, target) = setup(&dir);
        std::fs::write(&chunk.sentinel_path, "").unwrap();

        let err = builder.build(&chunk, &target).unwrap_err();

        assert!(matches!(err, SchedulerError::ScriptCollision { .. }));
        assert!(!chunk.script_path.exists());
    }
}
