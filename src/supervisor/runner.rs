//! Plugin process runner.
//!
//! A [`ProcessRunner`] owns exactly one OS process lifecycle:
//!
//! 1. [`start`](ProcessRunner::start) validates the launch parameters,
//!    spawns the process, enters [`StreamCapture`], and waits for exit.
//! 2. While it waits, other tasks may call [`terminate`](ProcessRunner::terminate),
//!    [`kill`](ProcessRunner::kill), [`associate`](ProcessRunner::associate),
//!    or read [`state`](ProcessRunner::state) at any time.
//! 3. After exit the capture is drained, and only then is the exit recorded.
//!
//! Runners are never reused; a restart is a new runner built from the same
//! [`LaunchParams`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::supervisor::capture::{CaptureConfig, StreamCapture};
use crate::{AppError, Result};

/// Static parameters a plugin process is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Argument vector; the first element is the executable.
    pub args: Vec<String>,
    /// Working directory; must exist and be a directory.
    pub working_dir: PathBuf,
    /// Complete environment of the process (nothing is inherited).
    pub env: HashMap<String, String>,
    /// Whether stdout/stderr are captured to sink files.
    pub capture_streams: bool,
}

impl LaunchParams {
    /// Display name derived from the working directory.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.working_dir.file_name().map_or_else(
            || self.working_dir.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }

    /// Check the parameters before any process is spawned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` for an empty argument vector or a working
    /// directory that does not exist or is not a directory.
    pub fn validate(&self) -> Result<()> {
        match self.args.first() {
            Some(program) if !program.is_empty() => {}
            _ => return Err(AppError::Launch("argument vector is empty".into())),
        }

        let metadata = std::fs::metadata(&self.working_dir).map_err(|err| {
            AppError::Launch(format!(
                "working directory {} unavailable: {err}",
                self.working_dir.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(AppError::Launch(format!(
                "working directory {} is not a directory",
                self.working_dir.display()
            )));
        }
        Ok(())
    }
}

/// Immutable snapshot of a runner's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerState {
    /// Stable runner identity.
    pub runner_id: String,
    /// Display name derived from the working directory.
    pub runner_name: String,
    /// Worker instance this runner was associated with, once known.
    pub instance_id: Option<String>,
    /// A restart was requested; the runner will not be marked dead.
    pub restart_requested: bool,
    /// An intentional stop was requested.
    pub stopped: bool,
    /// The process exited and is not expected to be revived.
    pub dead: bool,
    /// OS process id while the process is alive.
    pub pid: Option<u32>,
    /// Exit code reported by the OS, if the process exited normally.
    pub exit_code: Option<i32>,
}

/// Outcome of a completed [`ProcessRunner::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Runner that supervised the process.
    pub runner_id: String,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal on unix, when the process was signalled.
    pub signal: Option<i32>,
    /// Whether the runner had been associated with an instance before exit.
    pub associated: bool,
    /// Whether the exit followed a stop or restart request.
    pub requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Interrupt,
    Kill,
}

struct Inner {
    phase: Phase,
    state: RunnerState,
}

struct Shared {
    params: LaunchParams,
    capture: CaptureConfig,
    inner: RwLock<Inner>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
}

/// Supervisor of a single plugin process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProcessRunner {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        write!(f, "{}.{}", inner.state.runner_name, inner.state.runner_id)
    }
}

impl ProcessRunner {
    /// Create a runner; nothing is spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(runner_id: impl Into<String>, params: LaunchParams, capture: CaptureConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let state = RunnerState {
            runner_id: runner_id.into(),
            runner_name: params.display_name(),
            instance_id: None,
            restart_requested: false,
            stopped: false,
            dead: false,
            pid: None,
            exit_code: None,
        };
        Self {
            shared: Arc::new(Shared {
                params,
                capture,
                inner: RwLock::new(Inner {
                    phase: Phase::Created,
                    state,
                }),
                control_tx,
                control_rx: Mutex::new(Some(control_rx)),
            }),
        }
    }

    /// Create a runner with a generated identity.
    #[must_use]
    pub fn with_generated_id(params: LaunchParams, capture: CaptureConfig) -> Self {
        Self::new(Uuid::new_v4().to_string(), params, capture)
    }

    /// Parameters this runner launches with; reused to build a restart runner.
    #[must_use]
    pub fn launch_params(&self) -> &LaunchParams {
        &self.shared.params
    }

    /// Snapshot of every runner attribute.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.read().state.clone()
    }

    /// Whether the process has been spawned and has not yet been reaped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.read().phase == Phase::Running
    }

    /// Record which worker instance this runner supervises.
    pub fn associate(&self, instance_id: impl Into<String>) {
        let instance_id = instance_id.into();
        let mut inner = self.write();
        if let Some(previous) = inner.state.instance_id.as_deref() {
            if previous != instance_id {
                debug!(runner = %inner.state.runner_id, previous, %instance_id, "replacing instance association");
            }
        }
        inner.state.instance_id = Some(instance_id);
    }

    /// Ask the process to shut down gracefully (SIGINT on unix).
    ///
    /// No-op unless the process is running. Does not wait for exit.
    pub fn terminate(&self) {
        self.request_stop(false, Control::Interrupt);
    }

    /// Forcibly terminate the process.
    ///
    /// No-op unless the process is running. Does not wait for exit.
    pub fn kill(&self) {
        self.request_stop(false, Control::Kill);
    }

    /// Mark the runner for restart and ask the process to shut down.
    ///
    /// The runner is not marked dead when the process exits; the caller
    /// launches a replacement from [`launch_params`](Self::launch_params).
    pub fn request_restart(&self) {
        self.request_stop(true, Control::Interrupt);
    }

    /// Run [`start`](Self::start) on its own task.
    #[must_use]
    pub fn spawn(&self) -> JoinHandle<Result<ExitReport>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.start().await })
    }

    /// Launch the process and supervise it until it exits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the runner was already started or the
    /// process cannot be spawned; the runner is left dead in the latter case.
    /// Returns `AppError::Io` if waiting on the process fails.
    pub async fn start(&self) -> Result<ExitReport> {
        let span = info_span!("runner", runner = %self);
        self.run().instrument(span).await
    }

    async fn run(&self) -> Result<ExitReport> {
        let control_rx = self
            .shared
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Launch("runner was already started".into()))?;

        let _exit_guard = ExitGuard(self);
        self.write().phase = Phase::Running;
        let params = &self.shared.params;
        debug!(args = ?params.args, cwd = %params.working_dir.display(), "starting plugin process");

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(err) => {
                error!(%err, "plugin died before it started");
                self.record_exit(None);
                return Err(err);
            }
        };

        let pid = child.id();
        self.write().state.pid = pid;
        info!(pid, "plugin process started");

        let label = self.to_string();
        let capture = if params.capture_streams {
            StreamCapture::enter(
                &label,
                &params.working_dir,
                child.stdout.take(),
                child.stderr.take(),
                self.shared.capture,
            )
            .await
        } else {
            StreamCapture::disabled()
        };

        let waited = wait_for_exit(&mut child, control_rx).await;
        capture.drain().await;

        let status = match waited {
            Ok(status) => status,
            Err(err) => {
                let state = self.record_exit(None);
                error!(%err, dead = state.dead, "lost track of plugin process");
                return Err(AppError::Io(format!("failed waiting on plugin: {err}")));
            }
        };

        let state = self.record_exit(status.code());
        let report = ExitReport {
            runner_id: state.runner_id.clone(),
            exit_code: status.code(),
            signal: exit_signal(status),
            associated: state.instance_id.is_some(),
            requested: state.stopped,
        };

        if !report.associated {
            warn!(
                exit_code = report.exit_code,
                signal = report.signal,
                "plugin terminated before successfully initializing"
            );
        }
        if !report.requested {
            error!(
                exit_code = report.exit_code,
                signal = report.signal,
                "plugin unexpectedly shut down"
            );
        }
        info!(dead = state.dead, "plugin is officially stopped");

        Ok(report)
    }

    fn spawn_child(&self) -> Result<Child> {
        let params = &self.shared.params;
        params.validate()?;

        let (program, args) = params
            .args
            .split_first()
            .ok_or_else(|| AppError::Launch("argument vector is empty".into()))?;

        let output = || {
            if params.capture_streams {
                Stdio::piped()
            } else {
                Stdio::inherit()
            }
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&params.env)
            .current_dir(&params.working_dir)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);

        // Own process group: terminal signals reach the supervisor, which
        // decides how plugins are stopped.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
            .map_err(|err| AppError::Launch(format!("failed to spawn {program}: {err}")))
    }

    /// Flag an intentional stop and relay `signal` to the supervising task.
    /// The state is left untouched if nothing is running.
    fn request_stop(&self, restart: bool, signal: Control) {
        let mut inner = self.write();
        if inner.phase != Phase::Running {
            return;
        }
        if self.shared.control_tx.send(signal).is_err() {
            debug!(runner = %inner.state.runner_id, ?signal, "supervising task is gone; stop request dropped");
            return;
        }
        inner.state.stopped = true;
        if restart {
            inner.state.restart_requested = true;
        }
    }

    fn record_exit(&self, exit_code: Option<i32>) -> RunnerState {
        let mut inner = self.write();
        inner.phase = Phase::Exited;
        inner.state.pid = None;
        inner.state.exit_code = exit_code;
        inner.state.dead = !inner.state.restart_requested;
        inner.state.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.shared
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.shared
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records an exit if supervision ends without one, as when the task
/// running [`ProcessRunner::start`] panics or is aborted. The child is killed
/// by `kill_on_drop` in that case.
struct ExitGuard<'a>(&'a ProcessRunner);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if self.0.read().phase == Phase::Exited {
            return;
        }
        let state = self.0.record_exit(None);
        error!(runner = %state.runner_id, dead = state.dead, "supervision ended before the plugin exit was recorded");
    }
}

/// Wait for the child to exit while relaying stop signals to it.
async fn wait_for_exit(
    child: &mut Child,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> std::io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            Some(signal) = control.recv() => deliver(child, signal),
        }
    }
}

fn deliver(child: &mut Child, signal: Control) {
    match signal {
        Control::Interrupt => {
            debug!("sending interrupt to plugin process");
            if let Err(err) = interrupt(child) {
                warn!(%err, "failed to interrupt plugin process");
            }
        }
        Control::Kill => {
            warn!("killing plugin process");
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to kill plugin process");
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    // `None` once the child has been reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    signal::kill(Pid::from_raw(pid), Signal::SIGINT).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
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
