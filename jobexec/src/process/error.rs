//! Errors produced while running and signalling a job.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;

use thiserror::Error;

/// Failure of a single job attempt.
///
/// The value is `Clone` so that the error returned from
/// [`JobHandle::run`](super::JobHandle::run) and the one retained by
/// [`JobHandle::last_error`](super::JobHandle::last_error) are the same.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The command could not be launched.
    #[error("failed to spawn process {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// No command was configured before `run`.
    #[error("no command configured")]
    EmptyCommand,

    /// The process ran and terminated abnormally.
    #[error("{}", describe_exit(.code, .signal))]
    Exited {
        /// Exit code, when the OS reported a normal exit.
        code: Option<i32>,
        /// Terminating signal, when the OS reported one.
        signal: Option<i32>,
    },

    /// Waiting on the process failed.
    #[error("failed to wait for process: {source}")]
    Wait {
        #[source]
        source: Arc<io::Error>,
    },

    /// `kill` was called before a successful spawn.
    #[error("no process identifier")]
    NoProcessId,

    /// The process no longer exists.
    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    /// The OS refused to deliver the termination request.
    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    /// `run` was called while a previous run is still in flight.
    #[error("job is already running")]
    AlreadyRunning,
}

impl JobError {
    pub(crate) fn spawn(command: &str, source: io::Error) -> Self {
        Self::Spawn {
            command: command.to_string(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn wait(source: io::Error) -> Self {
        Self::Wait {
            source: Arc::new(source),
        }
    }

    /// Build the runtime failure for a non-successful exit status.
    pub(crate) fn from_status(status: ExitStatus) -> Self {
        Self::Exited {
            code: status.code(),
            signal: exit_signal(status),
        }
    }

    /// Whether this is the error a `kill` racing a finished process yields.
    ///
    /// Callers normally log and ignore it.
    pub const fn is_benign_kill_race(&self) -> bool {
        matches!(self, Self::ProcessNotFound { .. })
    }

    /// Whether the error happened before the process existed.
    pub const fn is_spawn_failure(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::EmptyCommand)
    }
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exit status {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "terminated abnormally".to_string(),
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}
