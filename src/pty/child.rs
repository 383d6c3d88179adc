//! Child process handle
//!
//! A [`ChildProcess`] is the only owner of a spawned pid. Reaping goes
//! through `waitpid` on that exact pid and happens at most once; signals are
//! addressed to the child's process group, which the child leads after
//! `setsid`.

use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// How a session's child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code
    Exited(i32),
    /// Terminated by a signal
    Signaled { signal: Signal, core_dumped: bool },
    /// The master descriptor failed; the child was killed as a consequence
    IoFailed(Errno),
    /// The pid was reaped by code outside this crate, so no status is known
    Vanished,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Signaled { signal, .. } => Some(*signal),
            _ => None,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, core_dumped) => Some(ExitStatus::Signaled {
                signal,
                core_dumped,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit status {}", code),
            ExitStatus::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "killed by {} (core dumped)", signal),
            ExitStatus::Signaled { signal, .. } => write!(f, "killed by {}", signal),
            ExitStatus::IoFailed(errno) => write!(f, "terminal I/O failed: {}", errno),
            ExitStatus::Vanished => write!(f, "reaped elsewhere"),
        }
    }
}

/// Serializable form of [`ExitStatus`] for reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub success: bool,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub description: String,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        ExitReport {
            success: status.success(),
            code: status.code(),
            signal: status.signal().map(|s| s.as_str().to_string()),
            description: status.to_string(),
        }
    }
}

/// A spawned child that leads its own session and process group
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    pub(crate) fn new(pid: Pid) -> Self {
        ChildProcess { pid, status: None }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Process group id; equal to the pid because the child called `setsid`
    pub fn pgid(&self) -> Pid {
        self.pid
    }

    /// Status recorded by a previous successful reap
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn is_reaped(&self) -> bool {
        self.status.is_some()
    }

    /// Reap without blocking. Returns the cached status once reaped.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>, Errno> {
        self.reap(Some(WaitPidFlag::WNOHANG))
    }

    /// Block until the child exits and reap it.
    pub fn reap_blocking(&mut self) -> Result<ExitStatus, Errno> {
        loop {
            if let Some(status) = self.reap(None)? {
                return Ok(status);
            }
        }
    }

    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Result<Option<ExitStatus>, Errno> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = match waitpid(self.pid, flags) {
            Ok(status) => ExitStatus::from_wait_status(status),
            Err(Errno::EINTR) => None,
            Err(Errno::ECHILD) => Some(ExitStatus::Vanished),
            Err(e) => return Err(e),
        };
        if let Some(status) = status {
            tracing::debug!(pid = self.pid.as_raw(), %status, "reaped child");
            self.status = Some(status);
        }
        Ok(status)
    }

    /// Send a signal to the child's process group.
    ///
    /// A group that no longer exists is not an error: the exit will be
    /// observed by the next reap.
    pub fn signal_group(&self, sig: Signal) -> Result<(), Errno> {
        if self.is_reaped() {
            return Ok(());
        }
        match signal::killpg(self.pgid(), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_reaped() {
            return;
        }
        tracing::warn!(pid = self.pid.as_raw(), "dropping unreaped child; killing it");
        let _ = self.signal_group(Signal::SIGKILL);
        let _ = self.reap_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_accessors() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(3).success());
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));

        let killed = ExitStatus::Signaled {
            signal: Signal::SIGTERM,
            core_dumped: false,
        };
        assert_eq!(killed.signal(), Some(Signal::SIGTERM));
        assert_eq!(killed.code(), None);
        assert!(!ExitStatus::IoFailed(Errno::EBADF).success());
    }

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 7)),
            Some(ExitStatus::Exited(7))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::StillAlive),
            None
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
    }

    #[test]
    fn test_exit_report() {
        let report = ExitReport::from(ExitStatus::Signaled {
            signal: Signal::SIGHUP,
            core_dumped: false,
        });
        assert!(!report.success);
        assert_eq!(report.signal.as_deref(), Some("SIGHUP"));
        assert_eq!(report.description, "killed by SIGHUP");
    }
}
