//! Attachment primitives for the injection window.
//!
//! The injector must hold the target stopped for the whole capture-to-
//! redirect window; these wrappers attach, wait for the stop with a bounded
//! deadline, and expose word-granular access to the stopped target's memory.

use std::ffi::c_void;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

use nurse::hijack::TargetMemory;

/// Possible errors attaching to or releasing a target.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// The target did not reach the stopped state before the deadline.
    /// Distinct from setup errors so callers can retry a fresh target.
    #[error("target {pid} did not stop within {timeout:?}")]
    Timeout { pid: Pid, timeout: Duration },
    #[error("no such target process: {0}")]
    NoSuchProcess(Pid),
    #[error("ptrace operation failed: {0}")]
    Sys(Errno),
}

impl From<Errno> for TraceError {
    fn from(errno: Errno) -> Self {
        TraceError::Sys(errno)
    }
}

/// An attached, stopped target.
///
/// Dropping detaches best-effort so an abandoned attempt never leaves the
/// target frozen; prefer [`detach`](Self::detach) for an error-checked
/// release.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    attached: bool,
}

impl Tracee {
    /// Attach to `pid` and wait for it to stop, bounded by `timeout`.
    ///
    /// On timeout the attachment is torn down before returning; no partial
    /// attachment survives a failed attempt.
    pub fn attach(pid: Pid, timeout: Duration) -> Result<Self, TraceError> {
        ptrace::attach(pid).map_err(|e| match e {
            Errno::ESRCH => TraceError::NoSuchProcess(pid),
            other => TraceError::Sys(other),
        })?;
        let mut tracee = Self { pid, attached: true };
        tracee.wait_for_stop(timeout)?;
        debug!(%pid, "target attached and stopped");
        Ok(tracee)
    }

    /// Poll for the attach-stop until `timeout` elapses.
    fn wait_for_stop(&mut self, timeout: Duration) -> Result<(), TraceError> {
        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Stopped(_, _)) => return Ok(()),
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    self.attached = false;
                    return Err(TraceError::NoSuchProcess(self.pid));
                }
                Ok(_) => {}
                Err(Errno::ECHILD | Errno::ESRCH) => {
                    self.attached = false;
                    return Err(TraceError::NoSuchProcess(self.pid));
                }
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                let pid = self.pid;
                // Abandon the attempt cleanly; the drop guard detaches.
                return Err(TraceError::Timeout { pid, timeout });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Detach and let the target resume.
    pub fn detach(mut self) -> Result<(), TraceError> {
        self.attached = false;
        ptrace::detach(self.pid, None::<Signal>)?;
        debug!(pid = %self.pid, "target detached and resumed");
        Ok(())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.attached {
            let _ = ptrace::detach(self.pid, None::<Signal>);
        }
    }
}

impl TargetMemory for Tracee {
    fn read_word(&mut self, addr: usize) -> Result<usize, Errno> {
        let word = ptrace::read(self.pid, addr as *mut c_void)?;
        Ok(word as usize)
    }

    fn write_word(&mut self, addr: usize, value: usize) -> Result<(), Errno> {
        // The target is stopped for the whole window, so a word-sized poke
        // cannot tear against running target code.
        unsafe { ptrace::write(self.pid, addr as *mut c_void, value as libc::c_long) }
    }
}
