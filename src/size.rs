//! Terminal window size and the ioctls that carry it

use std::fmt;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};

/// Window size in rows, columns, and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows (lines)
    pub rows: u16,
    /// Number of columns (characters per line)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub fn with_pixels(rows: u16, cols: u16, pixel_width: u16, pixel_height: u16) -> Self {
        WindowSize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    pub fn from_winsize(ws: libc::winsize) -> Self {
        WindowSize {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }

    /// Apply this size to a terminal descriptor (`TIOCSWINSZ`).
    ///
    /// Works on either side of the pair; on the master it changes the size
    /// the slave side observes.
    pub fn apply_to(&self, fd: RawFd) -> Result<(), Errno> {
        let ws = self.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
        let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &ws) };
        if result == -1 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    /// Read the size currently recorded by the kernel (`TIOCGWINSZ`).
    pub fn read_from(fd: RawFd) -> Result<Self, Errno> {
        // SAFETY: winsize is plain data; all-zero is a valid value
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes into the winsize struct we own
        let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
        if result == -1 {
            Err(Errno::last())
        } else {
            Ok(WindowSize::from_winsize(ws))
        }
    }

    /// Rows and columns match, ignoring pixel dimensions
    pub fn same_cells(&self, other: &WindowSize) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        WindowSize::new(24, 80)
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}
