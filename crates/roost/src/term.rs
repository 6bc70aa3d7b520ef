//! Controlling-terminal helpers for the attach client: raw mode with a
//! restore-on-drop guard, and window-size queries.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;

/// Puts a terminal into raw mode and restores the saved state when dropped,
/// so every exit path (detach, remote exit, connection drop, panic
/// unwinding) puts the terminal back.
pub struct RawModeGuard {
    fd: RawFd,
    saved: libc::termios,
    restored: bool,
}

impl RawModeGuard {
    pub fn new(fd: RawFd) -> io::Result<Self> {
        let mut saved = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, saved.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let saved = unsafe { saved.assume_init() };

        let mut raw = saved;
        unsafe { libc::cfmakeraw(&mut raw) };
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            saved,
            restored: false,
        })
    }

    /// Restore the saved state now, ahead of printing a status line or
    /// exiting the process. Safe to call more than once.
    pub fn restore(&mut self) {
        if !self.restored {
            unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved) };
            self.restored = true;
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current terminal dimensions as `(rows, cols)`, if `fd` is a terminal.
pub fn window_size(fd: RawFd) -> Option<(u16, u16)> {
    let mut ws = MaybeUninit::<libc::winsize>::uninit();
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, ws.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let ws = unsafe { ws.assume_init() };
    if ws.ws_row == 0 && ws.ws_col == 0 {
        return None;
    }
    Some((ws.ws_row, ws.ws_col))
}
