//! Process runner.
//!
//! Spawns one external process per call with:
//! - `env_clear()` + the explicit environment of its [`ProcessSpec`].
//! - piped stdin/stdout/stderr; the standard library opens every other
//!   descriptor close-on-exec, so nothing else is inherited.
//! - `kill_on_drop(true)` so a process is never left behind on an
//!   unexpected exit path (panic, dropped future).
//! - a bounded admission slot held for the lifetime of the process.
//!
//! Cancellation of the bound token sends `SIGTERM`, escalates to `SIGKILL`
//! after the grace period, and reaps the process before returning
//! `AppError::Cancelled`.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::{Admission, AdmissionPermit};
use super::spec::ProcessSpec;
use crate::bridge::ProcessPipes;
use crate::{AppError, Result};

/// Bytes of standard error retained for error reports.
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Spawns and supervises external processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    admission: Admission,
    grace: Duration,
    spawned: Arc<AtomicU64>,
}

/// Outcome of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// Exit status as reaped from the operating system.
    pub status: ExitStatus,
    /// Last [`STDERR_TAIL_BYTES`] of standard error, lossily decoded.
    pub stderr_tail: String,
}

impl ProcessExit {
    /// Exit code, `None` when the process was killed by a signal.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Convert into the error reported for an unexpected exit.
    #[must_use]
    pub fn into_error(self) -> AppError {
        AppError::ProcessExit {
            code: self.status.code(),
            stderr: self.stderr_tail,
        }
    }
}

/// A running process and its standard streams.
///
/// Owned by exactly one call. [`ManagedProcess::wait`] consumes the handle,
/// so the exit status is reaped exactly once.
#[derive(Debug)]
pub struct ManagedProcess {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
    grace: Duration,
    _permit: AdmissionPermit,
}

enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

impl ProcessRunner {
    /// Create a runner admitting at most `max_processes` concurrent processes.
    #[must_use]
    pub fn new(max_processes: usize, grace: Duration) -> Self {
        Self {
            admission: Admission::new(max_processes),
            grace,
            spawned: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the process described by `spec`.
    ///
    /// # Errors
    ///
    /// - `AppError::ResourceExhausted`: admission ceiling reached.
    /// - `AppError::Spawn`: invalid spec, missing executable, invalid
    ///   working directory, or fork failure.
    /// - `AppError::Cancelled`: the token was cancelled before spawning.
    pub fn start(&self, spec: ProcessSpec) -> Result<ManagedProcess> {
        spec.validate()?;

        if spec.cancel.is_cancelled() {
            return Err(AppError::Cancelled("cancelled before spawn".into()));
        }

        if !spec.current_dir.is_dir() {
            return Err(AppError::Spawn(format!(
                "working directory {} is not a directory",
                spec.current_dir.display()
            )));
        }

        let permit = self.admission.try_admit()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.current_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                AppError::Spawn(format!("executable '{}' not found", spec.program))
            }
            _ => AppError::Spawn(format!("failed to spawn '{}': {err}", spec.program)),
        })?;

        self.spawned.fetch_add(1, Ordering::Relaxed);

        info!(
            program = %spec.program,
            args = ?spec.args,
            pid = child.id().unwrap_or(0),
            "process spawned"
        );

        Ok(ManagedProcess {
            program: spec.program,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            cancel: spec.cancel,
            deadline: spec.deadline,
            grace: self.grace,
            _permit: permit,
        })
    }

    /// Total number of processes spawned by this runner.
    #[must_use]
    pub fn spawned_total(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Number of processes currently holding an admission slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.admission.active()
    }
}

impl ManagedProcess {
    /// Operating-system process id, `None` once reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Detach stdin and stdout for a stream bridge.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when either stream was already taken.
    pub fn take_pipes(&mut self) -> Result<ProcessPipes<ChildStdin, ChildStdout>> {
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| AppError::Io("process stdin already taken".into()))?;
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("process stdout already taken".into()))?;
        Ok(ProcessPipes { stdin, stdout })
    }

    /// Wait for the process to exit while draining its standard error.
    ///
    /// Only the calling task is suspended. Streams that were never taken
    /// are closed first so the process cannot block on them.
    ///
    /// # Errors
    ///
    /// - `AppError::Cancelled`: the token fired or the deadline elapsed; the
    ///   process has been terminated and reaped.
    /// - `AppError::Io`: waiting on the process failed.
    pub async fn wait(mut self) -> Result<ProcessExit> {
        drop(self.stdin.take());
        drop(self.stdout.take());
        let stderr = self.stderr.take();
        let cancel = self.cancel.clone();
        let deadline = self.deadline;

        let finished = {
            let exit = async { tokio::join!(self.child.wait(), read_tail(stderr)) };
            let expired = async {
                match deadline {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = cancel.cancelled() => Err(Interrupted::Cancelled),
                () = expired => Err(Interrupted::DeadlineExceeded),
                (status, stderr_tail) = exit => Ok((status, stderr_tail)),
            }
        };

        match finished {
            Ok((status, stderr_tail)) => {
                let status = status.map_err(|err| {
                    AppError::Io(format!("failed to wait for '{}': {err}", self.program))
                })?;
                debug!(program = %self.program, ?status, "process exited");
                Ok(ProcessExit {
                    status,
                    stderr_tail,
                })
            }
            Err(Interrupted::Cancelled) => {
                self.terminate().await;
                Err(AppError::Cancelled("call cancelled".into()))
            }
            Err(Interrupted::DeadlineExceeded) => {
                // Stop the copy loops sharing the token as well.
                cancel.cancel();
                self.terminate().await;
                Err(AppError::Cancelled("deadline exceeded".into()))
            }
        }
    }

    /// Send `SIGTERM`, then force-kill after the grace period, and reap.
    async fn terminate(&mut self) {
        let program = self.program.clone();
        send_terminate(&mut self.child);

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(program = %program, ?status, "process terminated after cancellation");
            }
            Ok(Err(err)) => {
                warn!(program = %program, %err, "error waiting for terminated process");
            }
            Err(_) => {
                warn!(
                    program = %program,
                    grace = ?self.grace,
                    "process did not exit within grace period, forcing kill"
                );
                // `kill` sends SIGKILL and reaps the process.
                if let Err(err) = self.child.kill().await {
                    warn!(program = %program, %err, "failed to force-kill process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(%err, "termination request failed");
    }
}

/// Read `stderr` to the end, keeping only the last [`STDERR_TAIL_BYTES`].
async fn read_tail(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES * 2 {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
            Err(err) => {
                debug!(%err, "stderr read failed");
                break;
            }
        }
    }

    let start = tail.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&tail[start..]).trim().to_owned()
}
