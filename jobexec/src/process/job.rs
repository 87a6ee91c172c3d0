//! A single externally spawned process attempt.
//!
//! A [`JobHandle`] carries:
//! - Launch configuration (command, arguments, working directory, stdin bytes)
//! - Captured stdout/stderr, filled by background pump tasks
//! - Runtime status (pid, exit code, last error, running flag)
//! - Optional `on_start` / `on_success` / `on_failure` callbacks
//!
//! Handles are cheap to clone; every clone refers to the same job.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::error::JobError;
use super::report::{JobReport, JobStatus};

/// Callback invoked at a lifecycle point with the handle itself.
pub type JobCallback = Arc<dyn Fn(&JobHandle) + Send + Sync>;

/// Size of the read buffer used by the output pumps.
const PUMP_CHUNK: usize = 8 * 1024;

#[derive(Clone, Default)]
struct Callbacks {
    on_start: Option<JobCallback>,
    on_success: Option<JobCallback>,
    on_failure: Option<JobCallback>,
}

/// Everything except the output buffers and the running flag.
#[derive(Default)]
struct JobState {
    job_tag: Option<u64>,
    working_dir: Option<PathBuf>,
    command: String,
    args: Vec<String>,
    stdin: Vec<u8>,
    asynchronous: bool,
    pid: Option<u32>,
    exit_code: i32,
    last_error: Option<JobError>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Set as soon as the child has been reaped; its pid is no longer ours.
    exited: bool,
    /// Claimed by `run` before spawning, released once the run is terminal.
    in_flight: bool,
    callbacks: Callbacks,
}

struct Shared {
    identity: u64,
    state: Mutex<JobState>,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    running: watch::Sender<bool>,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Shared {
    const fn buffer(&self, stream: Stream) -> &Mutex<Vec<u8>> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

/// Locks ignore poisoning: no lock is ever held while user code runs.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Launch parameters copied out of the state before spawning.
struct Launch {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    stdin: Vec<u8>,
    asynchronous: bool,
}

/// Tasks moving bytes between the child's pipes and the handle.
struct Pumps {
    stdout: Option<JoinHandle<io::Result<()>>>,
    stderr: Option<JoinHandle<io::Result<()>>>,
}

impl Pumps {
    /// Wait until both output streams hit EOF.
    async fn join(self) {
        for (name, task) in [("stdout", self.stdout), ("stderr", self.stderr)] {
            let Some(task) = task else { continue };
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(stream = name, error = %e, "output pump stopped early"),
                Err(e) => warn!(stream = name, error = %e, "output pump task failed"),
            }
        }
    }
}

/// Marks the run terminal when dropped, including on callback panic.
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        lock(&self.0.state).in_flight = false;
        self.0.running.send_replace(false);
    }
}

/// Handle to one process execution attempt.
///
/// # Example
///
/// ```rust,no_run
/// use jobexec::JobHandle;
///
/// #[tokio::main]
/// async fn main() {
///     let job = JobHandle::new("cat", Vec::<String>::new());
///     job.write_stdin("abc\n");
///     job.set_async(true);
///     job.on_success(|job| println!("done: {}", job.stdout_string()));
///
///     job.run().await.expect("spawn failed");
///     assert!(job.is_running());
///
///     job.wait().await;
///     assert_eq!(job.stdout(), b"abc\n");
/// }
/// ```
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::with_identity(0)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("JobHandle")
            .field("identity", &self.shared.identity)
            .field("command", &state.command)
            .field("args", &state.args)
            .field("pid", &state.pid)
            .field("running", &*self.shared.running.borrow())
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    /// Create an unpooled handle for `command` with `args`.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = Self::default();
        {
            let mut state = lock(&handle.shared.state);
            state.command = command.into();
            state.args = args.into_iter().map(Into::into).collect();
        }
        handle
    }

    pub(crate) fn with_identity(identity: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                identity,
                state: Mutex::new(JobState::default()),
                stdout: Mutex::new(Vec::new()),
                stderr: Mutex::new(Vec::new()),
                running: watch::Sender::new(false),
            }),
        }
    }

    /// Permanent identity; `0` for handles created outside a pool.
    pub fn identity(&self) -> u64 {
        self.shared.identity
    }

    /// Whether two values refer to the same underlying handle.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // === Configuration ===

    /// Set working directory, command and arguments in one call.
    ///
    /// An empty `working_dir` means the caller's current directory.
    pub fn configure<I, S>(
        &self,
        working_dir: impl Into<PathBuf>,
        command: impl Into<String>,
        args: I,
    ) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let working_dir = working_dir.into();
        let mut state = lock(&self.shared.state);
        state.working_dir = (!working_dir.as_os_str().is_empty()).then_some(working_dir);
        state.command = command.into();
        state.args.clear();
        state.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn set_working_dir(&self, dir: impl Into<PathBuf>) -> &Self {
        lock(&self.shared.state).working_dir = Some(dir.into());
        self
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        lock(&self.shared.state).working_dir.clone()
    }

    pub fn command(&self) -> String {
        lock(&self.shared.state).command.clone()
    }

    pub fn args(&self) -> Vec<String> {
        lock(&self.shared.state).args.clone()
    }

    /// Caller-level job number this handle is working for.
    pub fn set_job_tag(&self, tag: Option<u64>) -> &Self {
        lock(&self.shared.state).job_tag = tag;
        self
    }

    pub fn job_tag(&self) -> Option<u64> {
        lock(&self.shared.state).job_tag
    }

    /// When `true`, `run` returns right after spawning and the job
    /// finishes in a background task.
    pub fn set_async(&self, asynchronous: bool) -> &Self {
        lock(&self.shared.state).asynchronous = asynchronous;
        self
    }

    pub fn is_async(&self) -> bool {
        lock(&self.shared.state).asynchronous
    }

    /// Append bytes to be piped into the process's standard input.
    pub fn write_stdin(&self, bytes: impl AsRef<[u8]>) -> &Self {
        lock(&self.shared.state)
            .stdin
            .extend_from_slice(bytes.as_ref());
        self
    }

    pub fn stdin(&self) -> Vec<u8> {
        lock(&self.shared.state).stdin.clone()
    }

    // === Callbacks ===

    /// Called right after a successful spawn, before `run` returns.
    pub fn on_start<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        lock(&self.shared.state).callbacks.on_start = Some(Arc::new(callback));
        self
    }

    /// Called once the process exits with status zero.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        lock(&self.shared.state).callbacks.on_success = Some(Arc::new(callback));
        self
    }

    /// Called when the spawn fails or the process terminates abnormally.
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        lock(&self.shared.state).callbacks.on_failure = Some(Arc::new(callback));
        self
    }

    // === Status ===

    /// OS process id; `None` until a spawn succeeds.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.state).pid
    }

    /// Exit code of an abnormal normal-exit; `0` otherwise.
    pub fn exit_code(&self) -> i32 {
        lock(&self.shared.state).exit_code
    }

    /// Failure of the latest run, if any.
    pub fn last_error(&self) -> Option<JobError> {
        lock(&self.shared.state).last_error.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.state).started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.state).finished_at
    }

    /// Non-blocking: `true` from spawn until the terminal callback returned.
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Captured standard output so far.
    ///
    /// Stable only once [`is_running`](Self::is_running) reads `false`.
    pub fn stdout(&self) -> Vec<u8> {
        lock(&self.shared.stdout).clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        lock(&self.shared.stderr).clone()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&lock(&self.shared.stdout)).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&lock(&self.shared.stderr)).into_owned()
    }

    /// Snapshot of the handle for display or serialization.
    pub fn report(&self) -> JobReport {
        let running = self.is_running();
        let state = lock(&self.shared.state);
        let status = if running {
            JobStatus::Running
        } else if state.last_error.is_some() {
            JobStatus::Failed
        } else if state.finished_at.is_some() {
            JobStatus::Succeeded
        } else {
            JobStatus::Idle
        };
        JobReport {
            identity: self.shared.identity,
            job_tag: state.job_tag,
            command: state.command.clone(),
            args: state.args.clone(),
            working_dir: state.working_dir.clone(),
            pid: state.pid,
            status,
            exit_code: state.exit_code,
            error: state.last_error.as_ref().map(ToString::to_string),
            stdout: self.stdout_string(),
            stderr: self.stderr_string(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    // === Lifecycle ===

    /// Spawn the configured command.
    ///
    /// Returns the spawn error if the process could not be launched. In
    /// synchronous mode this also waits for exit and returns the outcome;
    /// in asynchronous mode it returns `Ok(())` immediately and the outcome
    /// shows up later in [`last_error`](Self::last_error).
    pub async fn run(&self) -> Result<(), JobError> {
        let launch = {
            let mut state = lock(&self.shared.state);
            if state.in_flight {
                return Err(JobError::AlreadyRunning);
            }
            state.in_flight = true;
            state.pid = None;
            state.exit_code = 0;
            state.last_error = None;
            state.started_at = None;
            state.finished_at = None;
            state.exited = false;
            Launch {
                command: state.command.clone(),
                args: state.args.clone(),
                working_dir: state.working_dir.clone(),
                stdin: state.stdin.clone(),
                asynchronous: state.asynchronous,
            }
        };

        let (child, pid) = match spawn_child(&launch) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.fail_spawn(&err);
                return Err(err);
            }
        };
        let span = info_span!("job", identity = self.shared.identity, pid);
        let (child, pumps) = self.attach_pipes(child, launch.stdin);

        let on_start = {
            let mut state = lock(&self.shared.state);
            state.pid = Some(pid);
            state.started_at = Some(Utc::now());
            state.callbacks.on_start.clone()
        };
        let finish = FinishGuard(self.shared.clone());
        self.shared.running.send_replace(true);
        span.in_scope(|| info!(command = %launch.command, "process started"));

        // Finalize owns the child from here on: a panicking `on_start` or a
        // dropped `run` future cannot strand the running flag.
        let (started_tx, started_rx) = oneshot::channel();
        let finalize = tokio::spawn(
            self.clone()
                .finalize(child, pumps, started_rx, finish)
                .instrument(span),
        );

        if let Some(callback) = on_start {
            callback(self);
        }
        let _ = started_tx.send(());

        if launch.asynchronous {
            return Ok(());
        }
        match finalize.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(JobError::wait(io::Error::other(e))),
        }
    }

    /// Record a spawn failure and notify `on_failure`.
    fn fail_spawn(&self, err: &JobError) {
        warn!(identity = self.shared.identity, error = %err, "process failed to start");
        let on_failure = {
            let mut state = lock(&self.shared.state);
            state.pid = None;
            state.last_error = Some(err.clone());
            state.in_flight = false;
            state.callbacks.on_failure.clone()
        };
        if let Some(callback) = on_failure {
            callback(self);
        }
    }

    /// Start the stdin writer and the stdout/stderr pumps.
    fn attach_pipes(&self, mut child: Child, input: Vec<u8>) -> (Child, Pumps) {
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    // The child may exit without reading its input.
                    debug!(error = %e, "stdin write incomplete");
                }
            });
        }

        let pumps = Pumps {
            stdout: child
                .stdout
                .take()
                .map(|pipe| tokio::spawn(pump(pipe, self.shared.clone(), Stream::Stdout))),
            stderr: child
                .stderr
                .take()
                .map(|pipe| tokio::spawn(pump(pipe, self.shared.clone(), Stream::Stderr))),
        };
        (child, pumps)
    }

    /// Wait for exit, record the outcome, dispatch the terminal callback,
    /// then clear the running flag.
    ///
    /// `started` resolves once `on_start` has returned (or unwound).
    async fn finalize(
        self,
        mut child: Child,
        pumps: Pumps,
        started: oneshot::Receiver<()>,
        finish: FinishGuard,
    ) -> Result<(), JobError> {
        let _finish = finish;

        let outcome = match child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(JobError::from_status(status)),
            Err(e) => Err(JobError::wait(e)),
        };
        lock(&self.shared.state).exited = true;
        pumps.join().await;
        // The terminal callback never overtakes `on_start`.
        let _ = started.await;

        let callback = {
            let mut state = lock(&self.shared.state);
            state.finished_at = Some(Utc::now());
            match &outcome {
                Ok(()) => state.callbacks.on_success.clone(),
                Err(err) => {
                    if let JobError::Exited {
                        code: Some(code), ..
                    } = err
                    {
                        state.exit_code = *code;
                    }
                    state.last_error = Some(err.clone());
                    state.callbacks.on_failure.clone()
                }
            }
        };

        match &outcome {
            Ok(()) => info!("process exited successfully"),
            Err(err) => info!(error = %err, "process failed"),
        }

        if let Some(callback) = callback {
            callback(&self);
        }
        outcome
    }

    /// Block until the current run, if any, has been finalized.
    pub async fn wait(&self) {
        let mut running = self.shared.running.subscribe();
        // The sender lives inside `self`, so the channel cannot close here.
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Request termination of the running process.
    ///
    /// Does not wait for exit; the finalize step observes the termination
    /// and reports it through `on_failure`.
    pub fn kill(&self) -> Result<(), JobError> {
        // Held across the signal so finalize cannot mark the child reaped
        // in between.
        let state = lock(&self.shared.state);
        let pid = state.pid.ok_or(JobError::NoProcessId)?;
        if state.exited || !self.is_running() {
            // Already reaped; the pid may belong to someone else by now.
            return Err(JobError::ProcessNotFound { pid });
        }
        info!(identity = self.shared.identity, pid, "killing process");
        terminate(pid)
    }

    /// Whether the process has exited, even if finalization is still
    /// dispatching its callback.
    pub fn has_exited(&self) -> bool {
        lock(&self.shared.state).exited
    }

    /// Return everything except the identity to its initial state.
    ///
    /// Must not be called while the job is running.
    pub fn reset(&self) {
        if self.is_running() {
            warn!(identity = self.shared.identity, "resetting a running job");
        }
        {
            let mut state = lock(&self.shared.state);
            state.job_tag = None;
            state.working_dir = None;
            state.command.clear();
            state.args.clear();
            state.stdin.clear();
            state.asynchronous = false;
            state.pid = None;
            state.exit_code = 0;
            state.last_error = None;
            state.started_at = None;
            state.finished_at = None;
            state.exited = false;
            state.in_flight = false;
            state.callbacks = Callbacks::default();
        }
        lock(&self.shared.stdout).clear();
        lock(&self.shared.stderr).clear();
        self.shared.running.send_replace(false);
    }
}

fn spawn_child(launch: &Launch) -> Result<(Child, u32), JobError> {
    if launch.command.is_empty() {
        return Err(JobError::EmptyCommand);
    }

    let mut cmd = Command::new(&launch.command);
    cmd.args(&launch.args);
    if let Some(ref dir) = launch.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| JobError::spawn(&launch.command, e))?;

    // tokio only drops the id after the child has been reaped.
    if let Some(pid) = child.id() {
        Ok((child, pid))
    } else {
        let _ = child.start_kill();
        Err(JobError::spawn(
            &launch.command,
            io::Error::other("spawned child has no process id"),
        ))
    }
}

async fn pump<R>(mut pipe: R, shared: Arc<Shared>, stream: Stream) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; PUMP_CHUNK];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        lock(shared.buffer(stream)).extend_from_slice(&chunk[..n]);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), JobError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| JobError::ProcessNotFound { pid })?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(JobError::ProcessNotFound { pid }),
        Err(e) => Err(JobError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), JobError> {
    Err(JobError::Signal {
        pid,
        message: "killing by process id is not supported on this platform".to_string(),
    })
}
