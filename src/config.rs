//! Configuration for the batch alignment scheduler.

use crate::chunk::JobBudget;
use crate::target::{QueueProfile, ReferenceTarget, TargetProfile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a scheduler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Query input
    pub input: InputConfig,

    /// Run directory layout
    pub output: OutputConfig,

    /// Reference target searched by the aligner
    pub target: TargetConfig,

    /// Job sizing
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Alignment step of each job script
    #[serde(default = "default_aligner")]
    pub aligner: ToolConfig,

    /// Format-conversion step of each job script
    #[serde(default)]
    pub converter: ConverterConfig,

    /// How job scripts are executed
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Grid queue settings (queue mode only)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Completion polling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Merge and validation after all chunks finish
    #[serde(default)]
    pub aggregate: AggregateConfig,

    /// Runtime tuning
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Query input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// FASTA file with the query sequences (plain or .gz)
    pub query: PathBuf,
}

/// Run directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Run directory; owned exclusively by one run
    pub dir: PathBuf,

    /// Stem for the tmp/archive/result directories and the recipe file
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Reference target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Which reference table row applies
    pub kind: ReferenceTarget,

    /// Database path handed to the aligner as `{reference}`
    pub database: String,

    /// Taxonomy table handed to downstream steps as `{taxonomy}`
    #[serde(default)]
    pub taxonomy: Option<String>,
}

/// Job sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Records per job for targets that are not capped
    #[serde(default = "default_records_per_job")]
    pub records_per_job: usize,

    /// Override for the large-target job cap
    #[serde(default)]
    pub max_jobs_for_large_target: Option<usize>,

    /// Threads passed to the aligner as `{threads}`
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            records_per_job: default_records_per_job(),
            max_jobs_for_large_target: None,
            threads: default_threads(),
        }
    }
}

/// An external program with templated arguments.
///
/// Each argument is a template; placeholders such as `{input}` are replaced
/// per argument and never re-split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Executable name or path
    pub program: String,

    /// Argument templates
    #[serde(default)]
    pub args: Vec<String>,
}

/// Output format of the converted per-chunk result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// Tab-separated hits, stored under `<prefix>_result/*.blast`
    Tabular,
    /// XML report, stored under `<prefix>_xml/*.xml`
    Xml,
}

/// Format-conversion step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Executable name or path
    #[serde(default = "default_converter_program")]
    pub program: String,

    /// Argument templates
    #[serde(default = "default_converter_args")]
    pub args: Vec<String>,

    /// Format the converter produces
    #[serde(default = "default_result_format")]
    pub format: ResultFormat,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_converter_program(),
            args: default_converter_args(),
            format: default_result_format(),
        }
    }
}

/// Execution backend for job scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Submit to a grid queue and wait for sentinels
    Queue,
    /// Run scripts as local child processes
    Local,
}

/// Dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Queue or local execution
    #[serde(default = "default_mode")]
    pub mode: DispatchMode,

    /// Concurrent child processes in local mode
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            local_workers: default_local_workers(),
        }
    }
}

/// Grid queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue for regular targets
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Queue for large targets (falls back to `name`)
    #[serde(default)]
    pub large_target_name: Option<String>,

    /// Submission client
    #[serde(default = "default_submit_program")]
    pub submit_program: String,

    /// Extra submission arguments placed before the script path
    #[serde(default = "default_submit_args")]
    pub submit_args: Vec<String>,

    /// Queue status client used for the availability probe
    #[serde(default = "default_probe_program")]
    pub probe_program: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            large_target_name: None,
            submit_program: default_submit_program(),
            submit_args: default_submit_args(),
            probe_program: default_probe_program(),
        }
    }
}

/// Completion polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Base tick between pending-sentinel checks, in milliseconds
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// Override for the target's authoritative scan interval
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// Give up waiting after this many seconds (unset = wait forever)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            interval_secs: None,
            timeout_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// How records are counted in the verified output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// One record per non-empty line
    Lines,
    /// One record per distinct query id: the first tab-separated column of
    /// each row, plus the id on each `# Query:` comment line
    QueryIds,
    /// One record per `>` header
    Fasta,
}

/// Which file is counted against the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Path template relative to the run directory (unset = merged results)
    #[serde(default)]
    pub path: Option<String>,

    /// Record counting rule
    #[serde(default = "default_record_format")]
    pub format: RecordFormat,

    /// Leading lines to skip before counting
    #[serde(default)]
    pub header_lines: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            path: None,
            format: default_record_format(),
            header_lines: 0,
        }
    }
}

/// Aggregation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Downstream steps run in order after the merge
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Final record-count check
    #[serde(default)]
    pub verify: VerifyConfig,
}

/// One downstream step (parser, taxonomy annotation, summary emit, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Name used in logs and errors
    pub name: String,

    /// The program and its argument templates
    #[serde(flatten)]
    pub tool: ToolConfig,
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for chunk recounts
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Profile of the configured reference target.
    pub fn target_profile(&self) -> TargetProfile {
        self.target.kind.profile()
    }

    /// Job budget for this run, with the configured cap override applied.
    pub fn job_budget(&self) -> JobBudget {
        let profile = self.target_profile();
        JobBudget {
            records_per_job: self.jobs.records_per_job,
            max_jobs_for_large_target: self
                .jobs
                .max_jobs_for_large_target
                .unwrap_or(profile.max_jobs_for_large_target),
            is_large_target: profile.is_large_target,
        }
    }

    /// Queue and polling cadence for this run.
    pub fn queue_profile(&self) -> QueueProfile {
        let profile = self.target_profile();
        let queue_name = if profile.is_large_target {
            self.queue
                .large_target_name
                .clone()
                .unwrap_or_else(|| self.queue.name.clone())
        } else {
            self.queue.name.clone()
        };
        QueueProfile {
            queue_name,
            poll_interval_secs: self
                .polling
                .interval_secs
                .unwrap_or(profile.poll_interval_secs),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.output.prefix.is_empty() || self.output.prefix.contains('/') {
            anyhow::bail!("Output prefix must be a non-empty name without '/'");
        }
        if self.jobs.records_per_job == 0 {
            anyhow::bail!("records_per_job must be > 0");
        }
        if self.jobs.max_jobs_for_large_target == Some(0) {
            anyhow::bail!("max_jobs_for_large_target must be > 0");
        }
        if self.jobs.threads == 0 {
            anyhow::bail!("threads must be > 0");
        }
        if self.dispatch.local_workers == 0 {
            anyhow::bail!("local_workers must be > 0");
        }
        if self.polling.tick_millis == 0 {
            anyhow::bail!("tick_millis must be > 0");
        }
        if self.polling.interval_secs == Some(0) {
            anyhow::bail!("Polling interval must be > 0");
        }
        if self.aligner.program.is_empty() || self.converter.program.is_empty() {
            anyhow::bail!("Aligner and converter programs must be set");
        }
        if !mentions(&self.aligner.args, "{archive}") {
            anyhow::bail!("Aligner arguments must write to {{archive}}");
        }
        if !mentions(&self.converter.args, "{result}") {
            anyhow::bail!("Converter arguments must write to {{result}}");
        }
        for step in &self.aggregate.steps {
            if step.name.is_empty() || step.tool.program.is_empty() {
                anyhow::bail!("Every aggregate step needs a name and a program");
            }
        }
        // Merged alignment output holds one row per hit, not per query
        let verify = &self.aggregate.verify;
        if verify.path.is_none() && verify.format == RecordFormat::Lines {
            anyhow::bail!(
                "Counting lines of the merged results does not give a record count; \
                 use verify.format query_ids or point verify.path at a per-query file"
            );
        }
        Ok(())
    }
}

fn mentions(args: &[String], placeholder: &str) -> bool {
    args.iter().any(|a| a.contains(placeholder))
}

fn default_aligner() -> ToolConfig {
    ToolConfig {
        program: "blastn".to_string(),
        args: [
            "-query", "{input}",
            "-db", "{reference}",
            "-outfmt", "11",
            "-out", "{archive}",
            "-num_threads", "{threads}",
            "-max_target_seqs", "10",
            "-evalue", "1e-5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
}

fn default_converter_args() -> Vec<String> {
    [
        "-archive", "{archive}",
        "-outfmt", "7 qseqid sseqid pident length mismatch gapopen qstart qend sstart send evalue bitscore staxids",
        "-out", "{result}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// Default value functions for serde
fn default_prefix() -> String { "blast".to_string() }
fn default_records_per_job() -> usize { 250 }
fn default_threads() -> usize { 1 }
fn default_converter_program() -> String { "blast_formatter".to_string() }
fn default_result_format() -> ResultFormat { ResultFormat::Tabular }
fn default_mode() -> DispatchMode { DispatchMode::Queue }
fn default_local_workers() -> usize { 4 }
fn default_queue_name() -> String { "all.q".to_string() }
fn default_submit_program() -> String { "qsub".to_string() }
fn default_submit_args() -> Vec<String> { vec!["-cwd".to_string(), "-V".to_string()] }
fn default_probe_program() -> String { "qstat".to_string() }
fn default_tick_millis() -> u64 { 1000 }
fn default_record_format() -> RecordFormat { RecordFormat::QueryIds }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
