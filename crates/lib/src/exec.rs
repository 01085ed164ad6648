//! Execution coordinator: run authorized commands one at a time per slot.
//!
//! No shell is used; the program and its arguments come straight from the authorization table.
//! Each [`AuthorizedCommand`] owns a [`Slot`]. Claiming the slot installs a cancellation token;
//! whoever fails to claim it sees the command as already running. The exec timeout and an
//! explicit cancel both end in the same interrupt (SIGINT on unix), and the process is killed
//! if it is still alive `exit_timeout` after that.

use std::fmt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizedCommand;
use crate::escape::ResponseBuilder;

const READ_CHUNK: usize = 4096;

/// Why a run failed. Rendered after the output block in the reply.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("process exited with {0}")]
    Exit(ExitStatus),

    #[error("process interrupted after exec timeout of {timeout:?}, {termination}")]
    TimedOut {
        timeout: Duration,
        termination: Termination,
    },

    #[error("process canceled, {termination}")]
    Canceled { termination: Termination },
}

/// How an interrupted process ended.
#[derive(Debug, Clone, Copy)]
pub struct Termination {
    pub status: ExitStatus,
    /// Set when the process outlived the exit timeout and was killed.
    pub killed_after: Option<Duration>,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.killed_after {
            Some(after) => write!(f, "killed after exit timeout of {:?} ({})", after, self.status),
            None => write!(f, "exited with {}", self.status),
        }
    }
}

/// Per-command execution state. Only the current claim holder touches the buffers.
#[derive(Debug, Default)]
pub struct Slot {
    cancel: Mutex<Option<CancellationToken>>,
    output: Mutex<Vec<u8>>,
    response: Mutex<ResponseBuilder>,
}

impl Slot {
    /// True while an execution holds the slot.
    pub fn is_running(&self) -> bool {
        lock(&self.cancel).is_some()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive hold on a slot. Dropping it returns the slot to idle.
pub struct SlotClaim {
    command: Arc<AuthorizedCommand>,
    token: CancellationToken,
}

impl SlotClaim {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        lock(&self.command.slot().output).clear();
        *lock(&self.command.slot().cancel) = None;
    }
}

/// Result of an exec request.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Another execution holds the slot; nothing was started.
    AlreadyRunning,
    /// The coordinator is shutting down and accepts no new work.
    ShuttingDown,
    /// The process ran (or failed to start). `reply` is the formatted MarkdownV2 response.
    Finished {
        reply: String,
        error: Option<ExecError>,
    },
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    NotRunning,
    Requested,
}

/// Coordinates executions across all slots. Slot tokens are children of a root token so
/// that shutdown interrupts everything in flight.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    root: CancellationToken,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the command's slot. Returns None if an execution is already in flight.
    pub fn try_claim(&self, command: &Arc<AuthorizedCommand>) -> Option<SlotClaim> {
        let mut cancel = lock(&command.slot().cancel);
        if cancel.is_some() {
            return None;
        }
        let token = self.root.child_token();
        *cancel = Some(token.clone());
        Some(SlotClaim {
            command: Arc::clone(command),
            token,
        })
    }

    /// Run the command if its slot is free and build the reply from its output.
    pub async fn execute(&self, command: Arc<AuthorizedCommand>) -> ExecOutcome {
        if self.root.is_cancelled() {
            return ExecOutcome::ShuttingDown;
        }
        let Some(claim) = self.try_claim(&command) else {
            return ExecOutcome::AlreadyRunning;
        };

        let mut output = std::mem::take(&mut *lock(&command.slot().output));
        let result = run_process(&command, claim.token(), &mut output).await;
        let reply = {
            let mut builder = lock(&command.slot().response);
            let err = result.as_ref().err().map(|e| e as &dyn fmt::Display);
            builder.build(&output, err).to_string()
        };
        output.clear();
        *lock(&command.slot().output) = output;
        drop(claim);

        ExecOutcome::Finished {
            reply,
            error: result.err(),
        }
    }

    /// Request an interrupt of the command's running execution. Returns immediately; the
    /// process exits and the slot is released on the execution's own path.
    pub fn cancel(&self, command: &AuthorizedCommand) -> CancelOutcome {
        let token = lock(&command.slot().cancel).clone();
        match token {
            Some(token) => {
                token.cancel();
                CancelOutcome::Requested
            }
            None => CancelOutcome::NotRunning,
        }
    }

    /// Interrupt every in-flight execution and refuse new ones.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum InterruptReason {
    Timeout,
    Canceled,
}

enum Event {
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
    Exited(std::io::Result<ExitStatus>),
    Interrupt(InterruptReason),
    KillDue,
}

async fn run_process(
    command: &AuthorizedCommand,
    token: &CancellationToken,
    output: &mut Vec<u8>,
) -> Result<(), ExecError> {
    let mut child = Command::new(&command.name)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ExecError::Spawn)?;
    log::debug!("exec: started {} (pid {:?})", command.name, child.id());

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];

    let deadline = tokio::time::sleep(command.exec_timeout);
    tokio::pin!(deadline);
    let mut kill_timer: Option<Pin<Box<Sleep>>> = None;
    let mut interrupted: Option<InterruptReason> = None;
    let mut killed = false;

    let status = loop {
        let event = tokio::select! {
            n = read_chunk(&mut stdout, &mut out_chunk) => Event::Stdout(n),
            n = read_chunk(&mut stderr, &mut err_chunk) => Event::Stderr(n),
            status = child.wait() => Event::Exited(status),
            _ = &mut deadline, if interrupted.is_none() => Event::Interrupt(InterruptReason::Timeout),
            _ = token.cancelled(), if interrupted.is_none() => Event::Interrupt(InterruptReason::Canceled),
            _ = wait_timer(&mut kill_timer), if !killed => Event::KillDue,
        };

        match event {
            Event::Stdout(n) => append_chunk(&mut stdout, &out_chunk, n, output),
            Event::Stderr(n) => append_chunk(&mut stderr, &err_chunk, n, output),
            Event::Exited(status) => break status.map_err(ExecError::Wait)?,
            Event::Interrupt(reason) => {
                log::info!("exec: interrupting {} ({:?})", command.name, reason);
                interrupted = Some(reason);
                interrupt(&mut child);
                kill_timer = Some(Box::pin(tokio::time::sleep(command.exit_timeout)));
            }
            Event::KillDue => {
                log::warn!(
                    "exec: {} still running {:?} after interrupt, killing",
                    command.name,
                    command.exit_timeout
                );
                killed = true;
                if let Err(e) = child.start_kill() {
                    log::debug!("exec: kill {}: {}", command.name, e);
                }
            }
        }
    };

    // A descendant may still hold the pipes open; bound the drain by the exit timeout.
    let drain = async {
        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                n = read_chunk(&mut stdout, &mut out_chunk) => append_chunk(&mut stdout, &out_chunk, n, output),
                n = read_chunk(&mut stderr, &mut err_chunk) => append_chunk(&mut stderr, &err_chunk, n, output),
            }
        }
    };
    if tokio::time::timeout(command.exit_timeout, drain).await.is_err() {
        log::debug!("exec: {} output still open after exit, dropping pipes", command.name);
    }

    let termination = Termination {
        status,
        killed_after: killed.then_some(command.exit_timeout),
    };
    match interrupted {
        Some(InterruptReason::Timeout) => Err(ExecError::TimedOut {
            timeout: command.exec_timeout,
            termination,
        }),
        Some(InterruptReason::Canceled) => Err(ExecError::Canceled { termination }),
        None if status.success() => Ok(()),
        None => Err(ExecError::Exit(status)),
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

fn append_chunk<R>(
    reader: &mut Option<R>,
    chunk: &[u8],
    n: std::io::Result<usize>,
    output: &mut Vec<u8>,
) {
    match n {
        Ok(0) => *reader = None,
        Ok(n) => output.extend_from_slice(&chunk[..n]),
        Err(e) => {
            log::debug!("exec: reading process output: {}", e);
            *reader = None;
        }
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Ask the process to stop. `child.id()` is None once the process has been reaped, so a
/// recycled pid is never signalled.
#[cfg(unix)]
fn interrupt(child: &mut tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => log::warn!("exec: SIGINT to pid {}: {}", pid, e),
    }
}

/// No graceful interrupt outside unix; the process is killed right away.
#[cfg(not(unix))]
fn interrupt(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("exec: kill pid {:?}: {}", child.id(), e);
    }
}
