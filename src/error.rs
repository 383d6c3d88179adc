//! Error types for PTY allocation, child attachment and session supervision.

use std::ffi::NulError;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::pty::ChildStep;
use crate::session::SessionId;

/// The terminal could not be allocated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] Errno),

    #[error("Failed to grant PTY access: {0}")]
    Grant(#[source] Errno),

    #[error("Failed to unlock PTY: {0}")]
    Unlock(#[source] Errno),

    #[error("Failed to get slave name: {0}")]
    SlaveName(#[source] Errno),

    #[error("Failed to configure PTY master descriptor: {0}")]
    Configure(#[source] Errno),
}

impl AllocationError {
    pub fn errno(&self) -> Errno {
        match *self {
            AllocationError::OpenMaster(e)
            | AllocationError::Grant(e)
            | AllocationError::Unlock(e)
            | AllocationError::SlaveName(e)
            | AllocationError::Configure(e) => e,
        }
    }
}

/// The program could not be started on the slave side.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Argument contains an interior nul byte: {0}")]
    InvalidArgument(#[from] NulError),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Failed to create spawn status pipe: {0}")]
    Pipe(#[source] Errno),

    #[error("Failed to fork: {0}")]
    Fork(#[source] Errno),

    #[error("Failed to read spawn status from child: {0}")]
    StatusUnreadable(#[source] Errno),

    #[error("Child failed to {step}: {source}")]
    Child {
        step: ChildStep,
        #[source]
        source: Errno,
    },
}

/// Starting a session failed; nothing it created is left open.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Could not allocate a terminal: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Program failed to start: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Failed to set initial window size: {0}")]
    InitialSize(#[source] Errno),
}

/// Errors surfaced by [`SessionSupervisor`](crate::SessionSupervisor) operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start session: {0}")]
    Start(#[from] StartError),

    #[error("{operation} on {session} timed out after {waited:?}")]
    Timeout {
        session: SessionId,
        operation: &'static str,
        waited: Duration,
    },

    #[error("{0} is closed")]
    Closed(SessionId),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("{0} has not terminated yet")]
    StillRunning(SessionId),

    #[error("I/O error on {session}: {source}")]
    Io {
        session: SessionId,
        #[source]
        source: Errno,
    },

    #[error("Failed to deliver {signal} to {session}: {source}")]
    Signal {
        session: SessionId,
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("Failed to poll: {0}")]
    Poll(#[source] Errno),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
