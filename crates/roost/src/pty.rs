//! PTY lifecycle: spawn a child under a fresh master/slave pair, expose the
//! master for async read/write, resize, wait, close.

use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::unix::AsyncFd;

use crate::error::{Error, Result};

/// Marker set in the hosted child so nested invocations can refuse to start.
pub const SESSION_ENV: &str = "ROOST_SESSION";
/// Marker telling a re-exec of this binary to take the server role. Stripped
/// from the hosted child's environment.
pub const SERVER_ENV: &str = "ROOST_SERVER";

pub struct Pty {
    master: AsyncFd<RawFd>,
    child: libc::pid_t,
    closed: AtomicBool,
}

impl Pty {
    /// Fork a child under a new PTY running `command` (or the default shell
    /// when empty) and wrap the master side for async I/O.
    ///
    /// The child environment is the daemon's with `ROOST_SESSION` set to the
    /// session name and `ROOST_SERVER` removed. Everything the child needs is
    /// allocated before the fork; the child branch only execs.
    pub fn spawn(session_name: &str, command: &[String]) -> Result<Pty> {
        let argv_strings: Vec<String> = if command.is_empty() {
            vec![default_shell()]
        } else {
            command.to_vec()
        };
        let display = argv_strings.join(" ");

        let argv: Vec<CString> = argv_strings
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::InvalidName(display.clone()))?;
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let envp = child_env(session_name);
        let mut envp_ptrs: Vec<*const libc::c_char> =
            envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let mut winsize = libc::winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let mut master_fd: libc::c_int = -1;
        let pid = unsafe {
            libc::forkpty(
                &mut master_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut winsize,
            )
        };

        if pid < 0 {
            return Err(Error::Spawn {
                command: display,
                source: io::Error::last_os_error(),
            });
        }

        if pid == 0 {
            // Child. Only exec from here; the parent's heap is off limits.
            unsafe {
                libc::execvpe(argv_ptrs[0], argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                let msg = b"exec failed\r\n";
                libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
                libc::_exit(127);
            }
        }

        set_nonblocking(master_fd).map_err(|source| Error::Spawn {
            command: display.clone(),
            source,
        })?;
        let master = AsyncFd::new(master_fd).map_err(|source| Error::Spawn {
            command: display,
            source,
        })?;

        Ok(Pty {
            master,
            child: pid,
            closed: AtomicBool::new(false),
        })
    }

    pub fn child_pid(&self) -> i32 {
        self.child
    }

    /// Read from the master. An error (including EIO after the child exits)
    /// is end-of-stream for the caller.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = *self.master.get_ref();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "pty closed"));
            }
            let mut guard = self.master.readable().await?;
            match guard.try_io(|_| unsafe {
                let n = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` to the master.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let fd = *self.master.get_ref();
        let mut offset = 0;
        while offset < data.len() {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "pty closed"));
            }
            let mut guard = self.master.writable().await?;
            let rest = &data[offset..];
            match guard.try_io(|_| unsafe {
                let n = libc::write(fd, rest.as_ptr().cast(), rest.len());
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the master's window size. Zero rows or columns are ignored.
    pub fn resize(&self, rows: u16, cols: u16) {
        if rows == 0 || cols == 0 {
            return;
        }
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            libc::ioctl(*self.master.get_ref(), libc::TIOCSWINSZ, &ws);
        }
    }

    /// Block (on a worker thread) until the child exits; returns its exit
    /// code, with signal deaths mapped to 128+signo.
    pub async fn wait(&self) -> io::Result<i32> {
        let pid = self.child;
        tokio::task::spawn_blocking(move || {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(if libc::WIFEXITED(status) {
                libc::WEXITSTATUS(status)
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                -1
            })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    /// Send a signal to the hosted child.
    pub fn kill(&self, signal: i32) {
        unsafe {
            libc::kill(self.child, signal);
        }
    }

    /// Release the master fd. Idempotent; safe after `wait`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(*self.master.get_ref());
            }
        }
    }

    #[cfg(test)]
    fn current_size(&self) -> (u16, u16) {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            libc::ioctl(*self.master.get_ref(), libc::TIOCGWINSZ, &mut ws);
        }
        (ws.ws_row, ws.ws_col)
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close();
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// The hosted child's environment: ours, minus the server marker, plus the
/// session marker.
fn child_env(session_name: &str) -> Vec<CString> {
    let mut env: Vec<CString> = Vec::new();
    for (key, value) in std::env::vars_os() {
        if key == SERVER_ENV || key == SESSION_ENV {
            continue;
        }
        let mut entry = OsString::from(key);
        entry.push("=");
        entry.push(value);
        if let Ok(cstr) = CString::new(entry.as_encoded_bytes()) {
            env.push(cstr);
        }
    }
    if let Ok(marker) = CString::new(format!("{SESSION_ENV}={session_name}")) {
        env.push(marker);
    }
    env
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── Unit tests ──────────────────────────────────────────────────────
