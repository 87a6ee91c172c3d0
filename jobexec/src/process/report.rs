//! Serializable snapshot of a job handle.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Status of a job as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Never run, or reset since.
    Idle,
    /// Spawned and not yet finalized.
    Running,
    /// Exited with status zero.
    Succeeded,
    /// Failed to spawn or terminated abnormally.
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached a terminal state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time copy of a handle's configuration, status and output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub identity: u64,
    pub job_tag: Option<u64>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: i32,
    /// Rendered last error, if any.
    pub error: Option<String>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobReport {
    /// Wall-clock run time, once the job has finished.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
