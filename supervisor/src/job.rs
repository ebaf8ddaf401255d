//! Job directory layout and the result types reported to the caller.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A required input file (INCAR, POSCAR, ...) is absent.
///
/// Downcastable through `anyhow::Error` so callers can tell "input missing"
/// apart from other failures without string matching.
#[derive(Debug)]
pub struct MissingInputError {
    pub path: PathBuf,
}

impl MissingInputError {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl fmt::Display for MissingInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "missing required input file {}", self.path.display())
    }
}

impl std::error::Error for MissingInputError {}

/// A VASP job's working directory and its canonical file names.
///
/// Exactly one supervisor may act on a job directory at a time; that
/// single-writer rule is the caller's responsibility and is not enforced by
/// locking here.
#[derive(Debug, Clone)]
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incar(&self) -> PathBuf {
        self.root.join("INCAR")
    }

    pub fn poscar(&self) -> PathBuf {
        self.root.join("POSCAR")
    }

    /// Path to an output stream file, e.g. `vasp.out`.
    pub fn output(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn error_counts(&self) -> PathBuf {
        self.root.join("error_counts.json")
    }

    pub fn chgcar(&self) -> PathBuf {
        self.root.join("CHGCAR")
    }

    pub fn wavecar(&self) -> PathBuf {
        self.root.join("WAVECAR")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("supervisor.toml")
    }
}

/// One applied fix: which handler fired and what it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub handler: String,
    pub description: String,
}

/// Why a job ended in failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    /// The process exited nonzero and no handler signature matched.
    Unmatched,
    /// The configured correction ceiling was reached; stopping rather than
    /// looping forever.
    RetryCeilingExceeded,
    /// A handler's `correct` failed; the job aborts rather than relaunching
    /// on half-applied state.
    HandlerFailed { handler: String, error: String },
    /// The caller requested abort.
    Aborted,
}

/// Final status of a supervised job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure(FailureKind),
}

/// Outcome of one supervised job, including the ordered correction history
/// so a human can audit exactly what was tried, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub corrections: Vec<Correction>,
    /// Exit code of the final process, `None` when it was killed by a signal
    /// or never exited on its own.
    pub exit_code: Option<i32>,
    /// Tail of the final output stream, for diagnostics.
    pub output_tail: String,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// Last `max_bytes` of `text`, truncated at a char boundary.
pub fn output_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_dir_paths_are_stable() {
        let job = JobDir::new("/work/job-1");
        assert_eq!(job.incar(), Path::new("/work/job-1/INCAR"));
        assert_eq!(job.poscar(), Path::new("/work/job-1/POSCAR"));
        assert_eq!(job.output("vasp.out"), Path::new("/work/job-1/vasp.out"));
        assert_eq!(
            job.error_counts(),
            Path::new("/work/job-1/error_counts.json")
        );
    }

    #[test]
    fn output_tail_keeps_short_text_whole() {
        assert_eq!(output_tail("short", 100), "short");
    }

    #[test]
    fn output_tail_truncates_on_char_boundary() {
        // 'é' is two bytes; a naive byte slice would split it.
        let text = "aéé";
        let tail = output_tail(text, 3);
        assert_eq!(tail, "é");
    }

    #[test]
    fn job_result_serializes_failure_kind() {
        let result = JobResult {
            status: JobStatus::Failure(FailureKind::HandlerFailed {
                handler: "eddrmm".to_string(),
                error: "boom".to_string(),
            }),
            corrections: vec![Correction {
                handler: "eddrmm".to_string(),
                description: "switched ALGO to Normal".to_string(),
            }],
            exit_code: Some(1),
            output_tail: String::new(),
        };
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"handler_failed\""));
        assert!(json.contains("\"eddrmm\""));
    }
}
