//! Sessions and their supervisor
//!
//! A session couples one master descriptor, one child process and one pump
//! for the session's whole lifetime. State only moves forward:
//!
//! ```text
//! Starting -> Running -> Exiting -> Terminated
//! ```
//!
//! A child that exits on its own still passes through `Exiting`: its exit
//! status is known from the reap, but the master stays open until the output
//! it left in the terminal has been read and accepted by the consumer.

mod supervisor;

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::consumer::Consumer;
use crate::pty::{ExitReport, ExitStatus};
use crate::pump::IoPump;
use crate::size::WindowSize;

pub use supervisor::SessionSupervisor;

/// Opaque, process-wide unique session handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Starting,
    Running,
    /// A termination signal was sent, or the child is reaped and its last
    /// output is still being handed over
    Exiting,
    /// The child is reaped and the master is closed. Final.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Exiting => "exiting",
            SessionState::Terminated => "terminated",
        })
    }
}

/// Whether a resize to the current size signals the child again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizePolicy {
    /// Identical sizes are a no-op
    #[default]
    SignalOnChange,
    /// Every resize delivers SIGWINCH
    AlwaysSignal,
}

/// Signals after which the child is expected to go away
pub fn is_termination_signal(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGHUP | Signal::SIGTERM | Signal::SIGKILL | Signal::SIGQUIT
    )
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: i32,
    pub program: String,
    pub state: SessionState,
    pub window_size: WindowSize,
    pub signals_delivered: u64,
    pub pending_input: usize,
    pub pending_output: usize,
    pub exit: Option<ExitReport>,
}

pub(crate) struct Session {
    id: SessionId,
    master: Option<OwnedFd>,
    pid: Pid,
    program: String,
    state: SessionState,
    window_size: WindowSize,
    pump: IoPump,
    consumer: Box<dyn Consumer>,
    signals_delivered: u64,
    io_failure: Option<Errno>,
    exit_status: Option<ExitStatus>,
    reaped_at: Option<Instant>,
    exit_notified: bool,
}

impl Session {
    fn new(
        id: SessionId,
        master: OwnedFd,
        pid: Pid,
        program: String,
        window_size: WindowSize,
        pump: IoPump,
        consumer: Box<dyn Consumer>,
    ) -> Self {
        Session {
            id,
            master: Some(master),
            pid,
            program,
            state: SessionState::Starting,
            window_size,
            pump,
            consumer,
            signals_delivered: 0,
            io_failure: None,
            exit_status: None,
            reaped_at: None,
            exit_notified: false,
        }
    }

    fn transition(&mut self, to: SessionState) {
        use SessionState::*;
        let allowed = matches!(
            (self.state, to),
            (Starting, Running) | (Running, Exiting) | (Running | Exiting, Terminated)
        );
        if !allowed {
            return;
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %to, "state change");
        self.state = to;
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            pid: self.pid.as_raw(),
            program: self.program.clone(),
            state: self.state,
            window_size: self.window_size,
            signals_delivered: self.signals_delivered,
            pending_input: self.pump.pending_input(),
            pending_output: self.pump.pending_output(),
            exit: self.exit_status.map(ExitReport::from),
        }
    }

    /// Reaped, but the master is still open for the output left behind
    fn is_draining(&self) -> bool {
        self.exit_status.is_some() && self.state != SessionState::Terminated
    }

    /// Hand buffered output to the consumer, then the exit notice once the
    /// session has terminated and nothing is left. Returns true while the
    /// consumer is holding output back.
    fn flush(&mut self) -> bool {
        self.pump.flush_to(self.consumer.as_mut());
        if self.pump.pending_output() > 0 {
            return true;
        }
        if self.state != SessionState::Terminated {
            return false;
        }
        if let (Some(status), false) = (self.exit_status, self.exit_notified) {
            self.exit_notified = true;
            self.consumer.on_exit(status);
            tracing::debug!(session = %self.id, %status, "exit delivered to consumer");
        }
        false
    }
}
