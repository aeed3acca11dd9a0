//! Queue stderr inspection.

use std::fmt;
use std::path::{Path, PathBuf};

/// Something worth an operator's attention in the queue capture files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueWarning {
    /// The capture file has content
    Errors { path: PathBuf, lines: Vec<String> },
    /// The capture file was never written
    MissingCapture { path: PathBuf },
    /// The capture file exists but could not be read
    Unreadable { path: PathBuf, error: String },
}

impl fmt::Display for QueueWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueWarning::Errors { path, lines } => {
                write!(f, "{} has {} line(s) of queue errors", path.display(), lines.len())?;
                for line in lines.iter().take(MAX_SHOWN) {
                    write!(f, "\n  {}", line)?;
                }
                if lines.len() > MAX_SHOWN {
                    write!(f, "\n  ... {} more", lines.len() - MAX_SHOWN)?;
                }
                Ok(())
            }
            QueueWarning::MissingCapture { path } => {
                write!(f, "{} is missing; queue errors were not captured", path.display())
            }
            QueueWarning::Unreadable { path, error } => {
                write!(f, "cannot read {}: {}", path.display(), error)
            }
        }
    }
}

const MAX_SHOWN: usize = 5;

/// Reports queue errors after a run. Never fails the run.
pub struct ErrorReporter;

impl ErrorReporter {
    /// Inspect a queue stderr capture and log what it finds.
    pub fn inspect(path: &Path) -> Vec<QueueWarning> {
        let warnings = match std::fs::read_to_string(path) {
            Ok(text) => {
                let lines: Vec<String> = text
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect();
                if lines.is_empty() {
                    Vec::new()
                } else {
                    vec![QueueWarning::Errors {
                        path: path.to_path_buf(),
                        lines,
                    }]
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![QueueWarning::MissingCapture {
                path: path.to_path_buf(),
            }],
            Err(e) => vec![QueueWarning::Unreadable {
                path: path.to_path_buf(),
                error: e.to_string(),
            }],
        };

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_capture_is_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qsub.err");
        std::fs::write(&path, "\n  \n").unwrap();

        assert!(ErrorReporter::inspect(&path).is_empty());
    }

    #[test]
    fn test_errors_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qsub.err");
        std::fs::write(&path, "Unable to run job: denied\n\nerror: queue all.q is full\n").unwrap();

        let warnings = ErrorReporter::inspect(&path);

        assert_eq!(warnings.len(), 1);
        match &warnings[0] {
            QueueWarning::Errors { lines, .. } => {
                assert_eq!(lines, &vec![
                    "Unable to run job: denied".to_string(),
                    "error: queue all.q is full".to_string(),
                ]);
            }
            other => panic!("unexpected warning: {}", other),
        }
    }

    #[test]
    fn test_missing_capture() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("qsub.err");

        let warnings = ErrorReporter::inspect(&path);

        assert_eq!(warnings, vec![QueueWarning::MissingCapture { path }]);
    }

    #[test]
    fn test_display_truncates_long_captures() {
        let warning = QueueWarning::Errors {
            path: PathBuf::from("qsub.err"),
            lines: (0..8).map(|i| format!("line {}", i)).collect(),
        };

        let text = warning.to_string();

        assert!(text.starts_with("qsub.err has 8 line(s)"));
        assert!(text.contains("line 4"));
        assert!(!text.contains("line 5"));
        assert!(text.ends_with("... 3 more"));
    }
}
