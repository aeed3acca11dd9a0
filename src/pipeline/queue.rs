//! Grid queue client.
//!
//! The scheduler only needs two things from a queue: an availability probe
//! and a way to hand over a script. Execution is observed through sentinel
//! files, never through a job handle.

use crate::config::QueueConfig;
use crate::job::CommandSpec;
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;

/// Result of the availability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAvailability {
    pub available: bool,

    /// First usable execution node, when known
    pub node: Option<String>,

    /// Human-readable reason when unavailable
    pub detail: String,
}

impl QueueAvailability {
    pub fn up(node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            available: true,
            detail: format!("node {}", node),
            node: Some(node),
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            available: false,
            node: None,
            detail: detail.into(),
        }
    }
}

/// Client for an external batch queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Check whether the queue has a node that can take jobs.
    async fn probe(&self, queue: &str) -> QueueAvailability;

    /// The command that submits `script` to `queue`.
    fn submit_command(&self, script: &Path, job_name: &str, queue: &str) -> CommandSpec;

    /// Run a submission command and capture its output.
    async fn run(&self, command: &CommandSpec) -> std::io::Result<Output> {
        command.output().await
    }
}

/// Grid Engine style client (`qsub` / `qstat`).
#[derive(Debug, Clone)]
pub struct GridEngineClient {
    submit_program: String,
    submit_args: Vec<String>,
    probe_program: String,
}

impl GridEngineClient {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            submit_program: config.submit_program.clone(),
            submit_args: config.submit_args.clone(),
            probe_program: config.probe_program.clone(),
        }
    }
}

#[async_trait]
impl QueueClient for GridEngineClient {
    async fn probe(&self, queue: &str) -> QueueAvailability {
        let cmd = CommandSpec::new(&self.probe_program).args(["-f", "-q", queue]);
        match cmd.output().await {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                match first_available_node(&stdout, queue) {
                    Some(node) => QueueAvailability::up(node),
                    None => QueueAvailability::down(format!("no usable node in queue {}", queue)),
                }
            }
            Ok(out) => QueueAvailability::down(format!(
                "{} exited with {}: {}",
                cmd,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => QueueAvailability::down(format!("cannot run {}: {}", self.probe_program, e)),
        }
    }

    fn submit_command(&self, script: &Path, job_name: &str, queue: &str) -> CommandSpec {
        CommandSpec::new(&self.submit_program)
            .args(["-q", queue, "-N", job_name])
            .args(self.submit_args.iter().cloned())
            .arg(script.display().to_string())
    }
}

/// State flags that make a queue instance unusable
/// (alarm, unknown, disabled, error, suspended, calendar-suspended/disabled).
const UNUSABLE_STATES: &[char] = &['a', 'u', 'd', 'E', 's', 'S', 'C', 'D'];

/// Find the first `queue@node` instance in `qstat -f` output whose state
/// column carries no unusable flag.
///
/// ```text
/// queuename          qtype resv/used/tot. load_avg arch     states
/// ---------------------------------------------------------------
/// all.q@node01       BIP   0/4/24         0.52     lx-amd64 d
/// all.q@node02       BIP   0/0/24         0.01     lx-amd64
/// ```
pub fn first_available_node(qstat_output: &str, queue: &str) -> Option<String> {
    let prefix = format!("{}@", queue);
    qstat_output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let instance = fields.next()?;
        let node = instance.strip_prefix(&prefix)?;
        let states = fields.nth(4).unwrap_or("");
        if states.chars().any(|c| UNUSABLE_STATES.contains(&c)) {
            None
        } else {
            Some(node.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT: &str = "\
queuename                      qtype resv/used/tot. load_avg arch          states
---------------------------------------------------------------------------------
all.q@node01                   BIP   0/4/24         0.52     lx-amd64      d
---------------------------------------------------------------------------------
all.q@node02                   BIP   0/0/24         0.01     lx-amd64      au
---------------------------------------------------------------------------------
all.q@node03                   BIP   0/2/24         0.10     lx-amd64
---------------------------------------------------------------------------------
big.q@node09                   BIP   0/0/64         0.00     lx-amd64
";

    #[test]
    fn test_first_available_node_skips_bad_states() {
        assert_eq!(first_available_node(QSTAT, "all.q"), Some("node03".to_string()));
        assert_eq!(first_available_node(QSTAT, "big.q"), Some("node09".to_string()));
    }

    #[test]
    fn test_no_node_for_unknown_queue() {
        assert_eq!(first_available_node(QSTAT, "gpu.q"), None);
        assert_eq!(first_available_node("", "all.q"), None);
    }

    #[test]
    fn test_submit_command() {
        let client = GridEngineClient::new(&QueueConfig::default());
        let cmd = client.submit_command(Path::new("/run/blast_tmp/query.fasta_1.sh"), "blast_1", "all.q");
        assert_eq!(
            cmd.render(),
            "qsub -q all.q -N blast_1 -cwd -V /run/blast_tmp/query.fasta_1.sh"
        );
    }

    #[tokio::test]
    async fn test_probe_missing_program_is_down() {
        let client = GridEngineClient::new(&QueueConfig {
            probe_program: "/nonexistent/qstat".to_string(),
            ..QueueConfig::default()
        });
        let availability = client.probe("all.q").await;
        assert!(!availability.available);
        assert!(availability.detail.contains("cannot run"));
    }
}
