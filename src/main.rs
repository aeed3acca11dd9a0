//! Batch alignment scheduler CLI
//!
//! Splits a query file into alignment jobs, runs them on a grid queue or
//! locally, and merges the results.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use align_batch::config::DispatchMode;
use align_batch::{
    build_runtime, collect_run, init_rayon, run_pipeline, Config, ErrorReporter, JobStatus,
    Metrics, RunOutcome, RunReport, Scheduler, WorkLayout,
};

#[derive(Parser)]
#[command(name = "align-batch")]
#[command(about = "Split, submit and merge batch sequence alignment jobs", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the dispatch mode
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,

    /// Override the number of concurrent local jobs
    #[arg(long, global = true)]
    local_workers: Option<usize>,

    /// Give up waiting for jobs after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Queue,
    Local,
}

impl From<ModeArg> for DispatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Queue => DispatchMode::Queue,
            ModeArg::Local => DispatchMode::Local,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full scheduler (default if no command specified)
    Run,

    /// Count the input and show the job plan without writing anything
    Plan,

    /// Show the status of every job in the run directory
    Status,

    /// Wait for, merge and verify a run whose jobs were replayed by hand
    Collect,

    /// Report errors captured from the queue
    CheckErrors,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            let report = with_runtime(&config, run_pipeline(config.clone()))?;
            print_report(&report);
        }

        Some(Commands::Plan) => {
            plan_command(load_config(&cli)?)?;
        }

        Some(Commands::Status) => {
            status_command(load_config(&cli)?)?;
        }

        Some(Commands::Collect) => {
            let config = load_config(&cli)?;
            let report = with_runtime(&config, collect_run(config.clone()))?;
            print_report(&report);
        }

        Some(Commands::CheckErrors) => {
            check_errors_command(load_config(&cli)?);
        }

        Some(Commands::Validate) => {
            load_config(&cli)?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

/// Load, override and validate the configuration.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_file(&cli.config)?;

    // Apply overrides
    if let Some(mode) = cli.mode {
        config.dispatch.mode = mode.into();
    }
    if let Some(workers) = cli.local_workers {
        config.dispatch.local_workers = workers;
    }
    if let Some(secs) = cli.timeout {
        config.polling.timeout_secs = Some(secs);
    }

    config.validate()?;
    Ok(config)
}

fn with_runtime<F>(config: &Config, fut: F) -> Result<RunReport>
where
    F: std::future::Future<Output = Result<RunReport>>,
{
    init_rayon(config.processing.rayon_threads)?;
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(fut)
}

fn print_report(report: &RunReport) {
    println!("{}", report.stats);
    match &report.outcome {
        RunOutcome::Completed(merged) => {
            println!(
                "Verified {} records in {}",
                merged.records,
                merged.verified_path.display()
            );
        }
        RunOutcome::Degraded {
            reason,
            recipe,
            replay,
            pending,
        } => {
            println!("Queue unavailable: {}", reason);
            println!("All submission commands: {}", recipe.display());
            println!("Replay the {} unaccepted job(s) with: bash {}", pending, replay.display());
            println!("Then run: align-batch collect");
        }
    }
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
}

fn plan_command(config: Config) -> Result<()> {
    let scheduler = Scheduler::new(std::sync::Arc::new(config), Metrics::new());
    let estimate = scheduler.estimate_work()?;

    println!("\n=== Job Plan ===");
    println!("Input records: {}", estimate.input_records);
    println!("Records per job: {}", estimate.records_per_job);
    println!("Jobs: {}", estimate.total_chunks);
    if estimate.is_large_target {
        println!("Large target: job count capped");
    }
    println!("Dispatch mode: {:?}", estimate.mode);
    println!(
        "Queue: {} (full scan every {}s)",
        estimate.queue.queue_name, estimate.queue.poll_interval_secs
    );
    println!("================\n");
    Ok(())
}

fn status_command(config: Config) -> Result<()> {
    let scheduler = Scheduler::new(std::sync::Arc::new(config), Metrics::new());
    let statuses = scheduler.status()?;

    let count = |wanted: JobStatus| statuses.iter().filter(|(_, s)| *s == wanted).count();
    for (index, status) in &statuses {
        println!("{}\t{}", scheduler.layout().job_name(*index), status);
    }
    println!(
        "\n{} jobs: {} done, {} submitted, {} pending",
        statuses.len(),
        count(JobStatus::Done),
        count(JobStatus::Submitted),
        count(JobStatus::Pending)
    );
    Ok(())
}

fn check_errors_command(config: Config) {
    let layout = WorkLayout::from_config(&config);
    let warnings = ErrorReporter::inspect(&layout.queue_err());
    if warnings.is_empty() {
        println!("No queue errors in {}", layout.queue_err().display());
    }
    for warning in warnings {
        println!("{}", warning);
    }
}

fn generate_config_command(output: &Path) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r##"# Batch alignment scheduler configuration

# === INPUT: query sequences ===
input:
  # FASTA file, plain or gzip-compressed (.gz)
  query: "reads.fasta"

# === OUTPUT: run directory (one run per directory) ===
output:
  dir: "/tmp/align-run"

  # Stem for <prefix>_tmp, <prefix>_archive, <prefix>_result and the recipe
  prefix: "blast"

# === TARGET: reference database ===
target:
  # One of: ncbi_nt, ncbi16s, silva, greengenes, unite, custom
  # ncbi_nt is a large target: the job count is capped and polling is slower
  kind: silva
  database: "/db/silva/SILVA_138_SSURef"

  # Taxonomy table passed to downstream steps as {taxonomy}
  # taxonomy: "/db/silva/taxmap.txt"

# === JOBS: sizing ===
jobs:
  records_per_job: 250

  # Override the job cap for large targets
  # max_jobs_for_large_target: 100

  # Passed to the aligner as {threads}
  threads: 1

# === TOOLS: each argument is a template ===
# Placeholders: {input} {reference} {archive} {result} {index} {threads}
aligner:
  program: blastn
  args: ["-query", "{input}", "-db", "{reference}", "-outfmt", "11",
         "-out", "{archive}", "-num_threads", "{threads}",
         "-max_target_seqs", "10", "-evalue", "1e-5"]

converter:
  program: blast_formatter
  # Format 7 adds a "# Query:" line for every query, hit or not
  args: ["-archive", "{archive}", "-outfmt", "7 qseqid sseqid pident length mismatch gapopen qstart qend sstart send evalue bitscore staxids",
         "-out", "{result}"]
  # tabular or xml
  format: tabular

# === DISPATCH ===
dispatch:
  # queue (grid engine) or local (child processes)
  mode: queue
  local_workers: 4

queue:
  name: "all.q"
  # large_target_name: "big.q"
  submit_program: qsub
  submit_args: ["-cwd", "-V"]
  probe_program: qstat

# === POLLING ===
polling:
  # Milliseconds between checks of pending sentinels
  tick_millis: 1000

  # Seconds between full rescans (default: per target)
  # interval_secs: 60

  # Give up after this many seconds (default: wait forever)
  # timeout_secs: 86400

# === AGGREGATE: after all jobs finish ===
aggregate:
  # Steps run in order; placeholders: {merged} {out_dir} {result_dir}
  # {prefix} {reference} {taxonomy}
  steps: []
  # - name: taxonomy
  #   program: annotate_taxonomy
  #   args: ["{merged}", "{taxonomy}", "{out_dir}/{prefix}_taxonomy.tsv"]

  verify:
    # File counted against the input (default: the merged results)
    # path: "{prefix}_taxonomy.tsv"

    # query_ids, fasta, or lines (lines needs a per-query file in path)
    format: query_ids
    header_lines: 0

# === PROCESSING: runtime tuning ===
processing:
  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 4

  # Rayon thread pool size for chunk recounts (null = num CPUs)
  # rayon_threads: 4

  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"
"##;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
