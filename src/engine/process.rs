use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// How a termination request reached the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM delivered to the process id.
    Signalled { pid: u32 },
    /// The supervising task was asked to kill the child.
    KillRequested,
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("engine process has already exited")]
    AlreadyExited,

    #[error("could not terminate engine process (pid {pid:?}): {reason}")]
    Unreachable { pid: Option<u32>, reason: String },
}

/// Live reference to a spawned engine process.
///
/// Cloning is cheap; every clone talks to the same process. The supervising
/// side holds the matching `watch::Receiver` returned by [`ProcessHandle::new`]
/// and kills the child when it sees `true`.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Arc<watch::Sender<bool>>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> (Self, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        let handle = Self {
            pid,
            kill_tx: Arc::new(kill_tx),
            exited: Arc::new(AtomicBool::new(false)),
        };
        (handle, kill_rx)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Called by the supervisor once the child has been reaped.
    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Ask the process to stop.
    ///
    /// SIGTERM by pid is tried first so the engine can clean up; when no pid is
    /// known or the signal cannot be delivered, the supervisor is told to kill
    /// the child instead. Does not wait for the process to go away.
    pub fn terminate(&self) -> Result<Termination, TerminateError> {
        if self.has_exited() {
            return Err(TerminateError::AlreadyExited);
        }

        let signal_error = match self.pid {
            Some(pid) => match send_sigterm(pid) {
                Ok(()) => {
                    debug!("Sent SIGTERM to engine process {}", pid);
                    return Ok(Termination::Signalled { pid });
                }
                Err(e) => {
                    warn!("SIGTERM to engine process {} failed: {}", pid, e);
                    e.to_string()
                }
            },
            None => "process id unavailable".to_string(),
        };

        match self.kill_tx.send(true) {
            Ok(()) => Ok(Termination::KillRequested),
            Err(_) => Err(TerminateError::Unreachable {
                pid: self.pid,
                reason: format!("{}; supervisor no longer running", signal_error),
            }),
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}
