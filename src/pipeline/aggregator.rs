//! Merge, downstream steps and the final record-count check.

use crate::chunk::JobChunk;
use crate::config::{Config, RecordFormat, StepConfig, TargetConfig, VerifyConfig};
use crate::error::{Result, SchedulerError};
use crate::io::fasta::open_text;
use crate::io::{RunManifest, WorkLayout};
use crate::job::{CommandSpec, TemplateVars};
use crate::pipeline::Metrics;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// A merged and verified run result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedResult {
    /// Concatenated chunk results
    pub merged_path: PathBuf,

    /// File whose records were counted
    pub verified_path: PathBuf,

    /// Records counted, equal to the input count
    pub records: usize,

    /// Names of downstream steps that ran
    pub steps_run: Vec<String>,
}

/// Combines chunk results and checks nothing was lost.
pub struct ResultAggregator {
    layout: Arc<WorkLayout>,
    target: TargetConfig,
    steps: Vec<StepConfig>,
    verify: VerifyConfig,
    metrics: Arc<Metrics>,
}

impl ResultAggregator {
    pub fn new(
        layout: Arc<WorkLayout>,
        target: TargetConfig,
        steps: Vec<StepConfig>,
        verify: VerifyConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            layout,
            target,
            steps,
            verify,
            metrics,
        }
    }

    pub fn from_config(config: &Config, layout: Arc<WorkLayout>, metrics: Arc<Metrics>) -> Self {
        Self::new(
            layout,
            config.target.clone(),
            config.aggregate.steps.clone(),
            config.aggregate.verify.clone(),
            metrics,
        )
    }

    fn vars(&self, merged: &Path) -> TemplateVars {
        TemplateVars::new()
            .set("merged", merged.display().to_string())
            .set("out_dir", self.layout.root().display().to_string())
            .set("result_dir", self.layout.result_dir().display().to_string())
            .set("prefix", self.layout.prefix().to_string())
            .set("reference", self.target.database.clone())
            .set("taxonomy", self.target.taxonomy.clone().unwrap_or_default())
    }

    /// Merge chunk results in index order, run the downstream steps, and
    /// check the verified output holds exactly `expected` records.
    ///
    /// On a count mismatch every artifact is left in place.
    pub async fn merge(
        &self,
        chunks: &[JobChunk],
        expected: usize,
        manifest: &mut RunManifest,
    ) -> Result<MergedResult> {
        let start = Instant::now();
        let merged_path = self.layout.merged_result();

        let mut ordered: Vec<(usize, PathBuf)> = chunks
            .iter()
            .map(|c| (c.index, c.outputs.result.clone()))
            .collect();
        ordered.sort_by_key(|(index, _)| *index);

        let out = merged_path.clone();
        tokio::task::spawn_blocking(move || concat_results(&ordered, &out))
            .await
            .map_err(|e| SchedulerError::io(&merged_path, std::io::Error::other(e)))??;
        tracing::info!("Merged {} chunk results into {}", chunks.len(), merged_path.display());

        let vars = self.vars(&merged_path);
        let mut steps_run = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            self.run_step(step, &vars, manifest).await?;
            steps_run.push(step.name.clone());
        }

        let verified_path = match &self.verify.path {
            Some(template) => self.layout.root().join(vars.expand(template)),
            None => merged_path.clone(),
        };
        let path = verified_path.clone();
        let (format, header_lines) = (self.verify.format, self.verify.header_lines);
        let actual = tokio::task::spawn_blocking(move || count_output_records(&path, format, header_lines))
            .await
            .map_err(|e| SchedulerError::io(&verified_path, std::io::Error::other(e)))??;

        self.metrics.add_aggregate_time(start.elapsed());

        if actual != expected {
            tracing::error!(
                "{} holds {} records, input had {}",
                verified_path.display(),
                actual,
                expected
            );
            return Err(SchedulerError::Integrity { expected, actual });
        }

        tracing::info!("Verified {} records in {}", actual, verified_path.display());
        Ok(MergedResult {
            merged_path,
            verified_path,
            records: actual,
            steps_run,
        })
    }

    async fn run_step(&self, step: &StepConfig, vars: &TemplateVars, manifest: &mut RunManifest) -> Result<()> {
        let command = CommandSpec::from_tool(&step.tool, vars);
        manifest.append_recipe(command.render())?;
        tracing::info!("Running step {}: {}", step.name, command);

        let output = command.output().await.map_err(|e| SchedulerError::DownstreamFailed {
            step: step.name.clone(),
            code: None,
            stderr: e.to_string(),
        })?;
        self.metrics.add_step_run();

        if !output.status.success() {
            return Err(SchedulerError::DownstreamFailed {
                step: step.name.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Concatenate result files into `out`; a missing input is an error.
fn concat_results(results: &[(usize, PathBuf)], out: &Path) -> Result<()> {
    let file = File::create(out).map_err(|e| SchedulerError::io(out, e))?;
    let mut writer = BufWriter::new(file);

    for (index, path) in results {
        let mut input = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SchedulerError::MissingResult {
                index: *index,
                path: path.clone(),
            },
            _ => SchedulerError::io(path, e),
        })?;
        std::io::copy(&mut input, &mut writer).map_err(|e| SchedulerError::io(out, e))?;
    }

    writer.flush().map_err(|e| SchedulerError::io(out, e))
}

/// Count the records in an output file after skipping `header_lines`.
pub fn count_output_records(path: &Path, format: RecordFormat, header_lines: usize) -> Result<usize> {
    let reader = open_text(path)?;
    let mut ids = HashSet::new();
    let mut count = 0;

    for line in reader.lines().skip(header_lines) {
        let line = line.map_err(|e| SchedulerError::io(path, e))?;
        match format {
            RecordFormat::Lines => {
                if !line.trim().is_empty() {
                    count += 1;
                }
            }
            RecordFormat::Fasta => {
                if line.starts_with('>') {
                    count += 1;
                }
            }
            RecordFormat::QueryIds => {
                let id = match line.strip_prefix('#') {
                    Some(comment) => comment
                        .trim_start()
                        .strip_prefix("Query:")
                        .and_then(|rest| rest.split_whitespace().next()),
                    None => line.split('\t').next().filter(|id| !id.trim().is_empty()),
                };
                if let Some(id) = id {
                    ids.insert(id.to_string());
                }
            }
        }
    }

    Ok(match format {
        RecordFormat::QueryIds => ids.len(),
        _ => count,
    })
}
