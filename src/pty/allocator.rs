//! Master/slave pair allocation.
//!
//! Uses the POSIX PTY API:
//! - posix_openpt() to open the master
//! - grantpt() to set permissions on the slave
//! - unlockpt() to unlock the slave
//! - ptsname() to get the slave device path
//!
//! All three handshake steps complete before a [`PtyPair`] is handed out. If
//! any of them fails the master is closed before the error is returned.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};

use crate::error::AllocationError;

/// Open-mode options for the master descriptor.
///
/// The master is always opened read-write, without becoming the caller's
/// controlling terminal, and close-on-exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub nonblocking: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags { nonblocking: true }
    }
}

/// A freshly allocated master descriptor and the path of its slave.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave_path: PathBuf,
}

impl PtyPair {
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Slave path as a C string, ready to be handed to a forked child.
    pub fn slave_path_cstring(&self) -> Result<CString, std::ffi::NulError> {
        CString::new(self.slave_path.as_os_str().as_bytes())
    }

    /// Split into the owned master and the slave path.
    pub fn into_parts(self) -> (OwnedFd, PathBuf) {
        (self.master, self.slave_path)
    }
}

impl AsFd for PtyPair {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Allocates pseudoterminal pairs from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtyAllocator {
    flags: OpenFlags,
}

impl PtyAllocator {
    pub fn new(flags: OpenFlags) -> Self {
        PtyAllocator { flags }
    }

    /// Open a master, run the grant/unlock handshake and resolve the slave.
    pub fn allocate(&self) -> Result<PtyPair, AllocationError> {
        let master = posix_openpt(master_oflags()).map_err(AllocationError::OpenMaster)?;

        // `master` closes itself on every early return below
        grantpt(&master).map_err(AllocationError::Grant)?;
        unlockpt(&master).map_err(AllocationError::Unlock)?;
        let slave_name = slave_name(&master).map_err(AllocationError::SlaveName)?;

        let fd = master.into_raw_fd();
        // SAFETY: into_raw_fd released ownership of a valid open descriptor
        let master = unsafe { OwnedFd::from_raw_fd(fd) };

        set_cloexec(fd).map_err(AllocationError::Configure)?;
        if self.flags.nonblocking {
            set_nonblocking(fd, true).map_err(AllocationError::Configure)?;
        }

        tracing::debug!(fd, slave = %slave_name, "allocated pty pair");

        Ok(PtyPair {
            master,
            slave_path: PathBuf::from(slave_name),
        })
    }
}

#[cfg(target_os = "linux")]
fn master_oflags() -> OFlag {
    OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn master_oflags() -> OFlag {
    OFlag::O_RDWR | OFlag::O_NOCTTY
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> Result<String, Errno> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> Result<String, Errno> {
    use std::sync::Mutex;

    // ptsname returns a pointer into static storage
    static PTSNAME_LOCK: Mutex<()> = Mutex::new(());
    let _guard = PTSNAME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: calls are serialized and the result is copied out before unlock
    unsafe { nix::pty::ptsname(master) }
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let new_flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(new_flags)).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_flags(fd: RawFd) -> (FdFlag, OFlag) {
        let fd_flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
        let fl_flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        (fd_flags, fl_flags)
    }

    #[test]
    fn test_allocate_resolves_slave() {
        let pair = PtyAllocator::default().allocate().expect("Failed to allocate PTY");
        assert!(pair.master_fd() >= 0);
        assert!(pair.slave_path().exists());
        assert!(pair.slave_path().to_string_lossy().starts_with("/dev/"));
    }

    #[test]
    fn test_master_flags() {
        let pair = PtyAllocator::default().allocate().unwrap();
        let (fd_flags, fl_flags) = fd_flags(pair.master_fd());
        assert!(fd_flags.contains(FdFlag::FD_CLOEXEC));
        assert!(fl_flags.contains(OFlag::O_NONBLOCK));

        let blocking = PtyAllocator::new(OpenFlags { nonblocking: false })
            .allocate()
            .unwrap();
        let (_, fl_flags) = self::fd_flags(blocking.master_fd());
        assert!(!fl_flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_concurrent_pairs_are_distinct() {
        let a = PtyAllocator::default().allocate().unwrap();
        let b = PtyAllocator::default().allocate().unwrap();
        assert_ne!(a.slave_path(), b.slave_path());
        assert_ne!(a.master_fd(), b.master_fd());
    }

    #[test]
    fn test_slave_path_cstring() {
        let pair = PtyAllocator::default().allocate().unwrap();
        let c = pair.slave_path_cstring().unwrap();
        assert_eq!(c.to_bytes(), pair.slave_path().as_os_str().as_bytes());
    }
}
