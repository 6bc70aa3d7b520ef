//! Reusable harness for roost integration tests.
//!
//! Spawns the real binary (daemon role or full CLI) against an isolated
//! `XDG_DATA_HOME`, connects over the session's Unix socket, and speaks the
//! length-prefixed frame protocol with plain blocking I/O.

#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

// ── Frame constants (must match the roost binary) ───────────────────

pub const MSG_INPUT: u8 = 1;
pub const MSG_OUTPUT: u8 = 2;
pub const MSG_RESIZE: u8 = 3;
pub const MSG_EXIT: u8 = 4;

pub const SERVER_ENV: &str = "ROOST_SERVER";
pub const SESSION_ENV: &str = "ROOST_SESSION";

// ── Frame encoding ──────────────────────────────────────────────────

pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(msg_type);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub struct Frame {
    pub msg_type: u8,
    pub data: Vec<u8>,
}

// ── Test data dir ───────────────────────────────────────────────────

/// Isolated `XDG_DATA_HOME` for one test.
pub struct TestDir {
    _tmp: tempfile::TempDir,
    pub xdg_home: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let xdg_home = tmp.path().to_path_buf();
        Self {
            _tmp: tmp,
            xdg_home,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.xdg_home.join("roost")
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.data_dir().join(format!("{name}.sock"))
    }

    pub fn info_path(&self, name: &str) -> PathBuf {
        self.data_dir().join(format!("{name}.json"))
    }

    pub fn error_path(&self, name: &str) -> PathBuf {
        self.data_dir().join(format!("{name}.err"))
    }

    pub fn read_descriptor(&self, name: &str) -> io::Result<serde_json::Value> {
        let raw = fs::read_to_string(self.info_path(name))?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

pub fn roost_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_roost"))
}

// ── Daemon handle ───────────────────────────────────────────────────

/// A running session daemon. Kills the process and its files on drop.
pub struct DaemonHandle {
    pub child: Child,
    pub name: String,
    pub socket_path: PathBuf,
}

impl DaemonHandle {
    /// Wait for the daemon process itself to exit.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn the binary directly in the daemon role (`ROOST_SERVER=1 create ...`)
/// and wait for the socket to appear.
pub fn spawn_daemon(dir: &TestDir, name: &str, command: &[&str]) -> io::Result<DaemonHandle> {
    let mut cmd = Command::new(roost_bin());
    cmd.arg("create").arg(name).args(command);
    cmd.env("XDG_DATA_HOME", &dir.xdg_home);
    cmd.env(SERVER_ENV, "1");
    cmd.env_remove(SESSION_ENV);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn()?;

    let socket_path = dir.socket_path(name);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket_path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket did not appear within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    // Brief delay to let the listener start accepting.
    std::thread::sleep(Duration::from_millis(50));

    Ok(DaemonHandle {
        child,
        name: name.to_string(),
        socket_path,
    })
}

/// Run the CLI (launcher role) to completion with the test data dir.
pub fn run_cli(dir: &TestDir, args: &[&str], envs: &[(&str, &str)]) -> io::Result<Output> {
    let mut cmd = Command::new(roost_bin());
    cmd.args(args);
    cmd.env("XDG_DATA_HOME", &dir.xdg_home);
    cmd.env_remove(SERVER_ENV);
    cmd.env_remove(SESSION_ENV);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.output()
}

// ── Socket client ───────────────────────────────────────────────────

/// Blocking frame-level client for a session socket.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn send_input(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_frame(MSG_INPUT, data))
    }

    pub fn send_resize(&mut self, rows: u16, cols: u16) -> io::Result<()> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&rows.to_be_bytes());
        payload.extend_from_slice(&cols.to_be_bytes());
        self.stream.write_all(&encode_frame(MSG_RESIZE, &payload))
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read the next frame, waiting up to `timeout`. None on timeout or
    /// disconnect.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_buf.len() >= 5 {
                let len = u32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]) as usize;
                if self.read_buf.len() >= 5 + len {
                    let msg_type = self.read_buf[0];
                    let data = self.read_buf[5..5 + len].to_vec();
                    self.read_buf.drain(..5 + len);
                    return Some(Frame { msg_type, data });
                }
            }

            let now = Instant::now();
            if now > deadline {
                return None;
            }
            let remaining = deadline - now;
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 64 * 1024];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for a specific frame type, discarding others.
    pub fn wait_for(&mut self, msg_type: u8, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now > deadline {
                return None;
            }
            match self.recv_frame(deadline - now) {
                Some(frame) if frame.msg_type == msg_type => return Some(frame),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Collect every frame that arrives within `timeout`.
    pub fn collect_frames(&mut self, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        loop {
            let now = Instant::now();
            if now > deadline {
                break;
            }
            match self.recv_frame(deadline - now) {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }

    /// True once the server has closed its end of the connection.
    pub fn is_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            let now = Instant::now();
            if now > deadline {
                return false;
            }
            self.stream
                .set_read_timeout(Some((deadline - now).max(Duration::from_millis(50))))
                .ok();
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return true,
            }
        }
    }

    /// Concatenated payload of every `Output` frame within `timeout`.
    pub fn collect_output(&mut self, timeout: Duration) -> Vec<u8> {
        self.collect_frames(timeout)
            .iter()
            .filter(|f| f.msg_type == MSG_OUTPUT)
            .flat_map(|f| f.data.clone())
            .collect()
    }
}

pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    let stream = UnixStream::connect(socket_path)?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    Ok(SocketClient {
        stream,
        read_buf: Vec::new(),
    })
}

// ── PTY-backed CLI runs (for the attach client) ─────────────────────

/// The attach client needs a real terminal; run it with all three stdio
/// streams on the slave side of a fresh PTY pair and drive it from the
/// master.
pub struct PtyCli {
    pub child: Child,
    master: fs::File,
}

impl PtyCli {
    pub fn spawn(dir: &TestDir, args: &[&str]) -> io::Result<PtyCli> {
        use std::os::fd::FromRawFd;

        let mut master_fd: libc::c_int = -1;
        let mut slave_fd: libc::c_int = -1;
        let rc = unsafe {
            libc::openpty(
                &mut master_fd,
                &mut slave_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let stdio = |fd: libc::c_int| -> io::Result<Stdio> {
            let dup = unsafe { libc::dup(fd) };
            if dup < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { Stdio::from_raw_fd(dup) })
        };

        let mut cmd = Command::new(roost_bin());
        cmd.args(args);
        cmd.env("XDG_DATA_HOME", &dir.xdg_home);
        cmd.env_remove(SERVER_ENV);
        cmd.env_remove(SESSION_ENV);
        cmd.stdin(stdio(slave_fd)?)
            .stdout(stdio(slave_fd)?)
            .stderr(stdio(slave_fd)?);
        let child = cmd.spawn();
        unsafe {
            libc::close(slave_fd);
        }
        let child = child?;

        let master = unsafe { fs::File::from_raw_fd(master_fd) };
        Ok(PtyCli { child, master })
    }

    /// Type bytes at the client as if from the keyboard.
    pub fn write_master(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.master.write_all(bytes)
    }

    /// Read whatever the client printed (status lines + session output)
    /// until `timeout` elapses or the pty closes.
    pub fn read_master(&mut self, timeout: Duration) -> Vec<u8> {
        use std::os::fd::AsRawFd;
        let fd = self.master.as_raw_fd();
        set_nonblocking(fd);

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                collected.extend_from_slice(&buf[..n as usize]);
            } else if n == 0 {
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }
                break;
            }
        }
        collected
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            if Instant::now() > deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for PtyCli {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn set_nonblocking(fd: libc::c_int) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

// ── Misc helpers ────────────────────────────────────────────────────

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}
