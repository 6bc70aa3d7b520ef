//! On-disk session registry.
//!
//! Each session owns three files under the data directory: `<name>.json`
//! (descriptor), `<name>.sock` (the daemon's listener, and the authoritative
//! "session exists" signal) and `<name>.err` (transient spawn-failure
//! report). Lookups probe the recorded pid and reap entries whose daemon is
//! gone.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Session descriptor ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub pid: i32,
    /// Argv of the hosted command; empty means the default shell.
    pub command: Vec<String>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(name: &str, pid: i32, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            pid,
            command,
            last_active: Utc::now(),
        }
    }

    /// Command rendered for listings.
    pub fn command_display(&self) -> String {
        if self.command.is_empty() {
            "(default shell)".to_string()
        } else {
            self.command.join(" ")
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or(Error::NoDataDir)?;
    Ok(base.join("roost"))
}

pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir()?;
    if !dir.is_dir() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;
    }
    Ok(dir)
}

pub fn socket_path(name: &str) -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{name}.sock")))
}

pub fn info_path(name: &str) -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{name}.json")))
}

pub fn error_path(name: &str) -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{name}.err")))
}

/// A session exists iff its socket file does.
pub fn session_exists(name: &str) -> bool {
    socket_path(name).map(|p| p.exists()).unwrap_or(false)
}

// ── Descriptor persistence ──────────────────────────────────────────

pub fn save(session: &Session) -> Result<()> {
    let path = info_path(&session.name)?;
    let json = serde_json::to_vec(session)
        .map_err(|e| Error::Protocol(format!("descriptor encode: {e}")))?;
    fs::write(&path, json)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

pub fn load(name: &str) -> Result<Session> {
    let path = info_path(name)?;
    let data = fs::read(&path).map_err(|_| Error::NotFound(name.to_string()))?;
    serde_json::from_slice(&data).map_err(|_| Error::NotFound(name.to_string()))
}

/// Remove all files belonging to a session. Missing files are fine.
pub fn remove(name: &str) -> Result<()> {
    for path in [socket_path(name)?, info_path(name)?, error_path(name)?] {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

// ── Discovery ───────────────────────────────────────────────────────

/// All live sessions. Entries whose daemon pid is gone are reaped
/// (socket, descriptor and error file deleted) and omitted.
pub fn list() -> Result<Vec<Session>> {
    let dir = data_dir()?;
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(session) = load(name) else {
            continue;
        };
        if !is_process_alive(session.pid) {
            let _ = remove(name);
            continue;
        }
        sessions.push(session);
    }
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sessions)
}

/// The live session most recently touched by a client, if any.
pub fn most_recent() -> Result<Option<Session>> {
    let mut sessions = list()?;
    sessions.sort_by_key(|s| s.last_active);
    Ok(sessions.pop())
}

/// Null-signal probe. EPERM means the process exists but is not ours.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ── Unit tests ──────────────────────────────────────────────────────
