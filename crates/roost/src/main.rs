//! roost: detachable terminal sessions without touching your scrollback.
//!
//! The binary plays three roles: the CLI dispatcher, the foreground launcher
//! that forks a per-session daemon (re-executing itself with `ROOST_SERVER=1`
//! in a fresh session group), and the attach client. The daemon side lives in
//! [`server`], the client side in [`client`].

mod client;
mod detach;
mod error;
mod protocol;
mod pty;
mod registry;
mod server;
mod term;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::client::AttachOptions;
use crate::detach::DetachKeys;
use crate::error::Error;
use crate::pty::{SERVER_ENV, SESSION_ENV};
use crate::server::Server;

/// Primary detach-key override; `ROOST_DETACH_KEY_1`, `_2`, ... add more.
const DETACH_KEY_ENV: &str = "ROOST_DETACH_KEY";

const STARTUP_POLLS: u32 = 50;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "roost",
    version,
    about = "Detachable terminal sessions that leave your scrollback alone",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Suppress status messages
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Detach key (repeatable), e.g. "~.", "ctrl-a" or "^b"
    #[arg(short = 'd', long = "detach-key", global = true, value_name = "KEY")]
    detach_key: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Command to host in a new session (default shell when empty)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    run: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session named after the current directory and attach
    #[command(alias = "n")]
    New {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Create a named session and attach
    #[command(alias = "c")]
    Create {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Attach to a session (the most recent one when no name is given)
    #[command(alias = "a")]
    Attach { name: Option<String> },
    /// List live sessions
    #[command(alias = "ls")]
    List,
    /// Terminate a session and remove its files
    #[command(alias = "rm")]
    Delete { name: String },
    /// Terminate all sessions
    Clear,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if std::env::var(SERVER_ENV).as_deref() == Ok("1") {
        // Daemon role, re-executed by the launcher below.
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
        return match cli.command {
            Some(Command::Create { name, command }) => run_server(&name, &command).await,
            _ => bail!("{SERVER_ENV}=1 expects a `create <name>` invocation"),
        };
    }

    let keys = resolve_detach_keys(&cli.detach_key)?;
    match cli.command {
        None => create_and_attach(&generate_session_name(), &cli.run, cli.quiet, keys).await,
        Some(Command::New { command }) => {
            create_and_attach(&generate_session_name(), &command, cli.quiet, keys).await
        }
        Some(Command::Create { name, command }) => {
            create_and_attach(&name, &command, cli.quiet, keys).await
        }
        Some(Command::Attach { name }) => {
            ensure_not_nested()?;
            let name = match name {
                Some(name) => name,
                None => registry::most_recent()?
                    .map(|s| s.name)
                    .context("no sessions to attach to")?,
            };
            client::attach(
                &name,
                AttachOptions {
                    quiet: cli.quiet,
                    suppress_attached: false,
                    keys,
                },
            )
            .await?;
            Ok(())
        }
        Some(Command::List) => cmd_list(),
        Some(Command::Delete { name }) => cmd_delete(&name),
        Some(Command::Clear) => cmd_clear(),
    }
}

// ── Daemon role ─────────────────────────────────────────────────────

/// Startup failures land in `<name>.err` so the foreground launcher can
/// report them; the daemon itself has no terminal to speak to.
async fn run_server(name: &str, command: &[String]) -> anyhow::Result<()> {
    // Detached from any terminal; a hangup from the dying launcher terminal
    // must not take the session with it.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    match Server::start(name, command) {
        Ok((server, listener)) => {
            server.run(listener).await?;
            Ok(())
        }
        Err(e) => {
            if let Ok(path) = registry::error_path(name) {
                let _ = write_private(&path, e.to_string().as_bytes());
            }
            Err(e.into())
        }
    }
}

// ── Launcher ────────────────────────────────────────────────────────

async fn create_and_attach(
    name: &str,
    command: &[String],
    quiet: bool,
    keys: DetachKeys,
) -> anyhow::Result<()> {
    ensure_not_nested()?;
    validate_name(name)?;

    if registry::session_exists(name) {
        return Err(Error::AlreadyExists(name.to_string()).into());
    }

    registry::ensure_data_dir()?;
    let err_path = registry::error_path(name)?;
    let _ = std::fs::remove_file(&err_path);

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut daemon = std::process::Command::new(exe);
    daemon
        .arg("create")
        .arg(name)
        .args(command)
        .env(SERVER_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        use std::os::unix::process::CommandExt;
        // The daemon leads its own session so it survives this terminal.
        daemon.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    daemon.spawn().context("failed to start session daemon")?;

    for _ in 0..STARTUP_POLLS {
        if registry::session_exists(name) {
            break;
        }
        if let Some(reason) = consume_error_file(&err_path) {
            bail!("{reason}");
        }
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
    }

    if !registry::session_exists(name) {
        if let Some(reason) = consume_error_file(&err_path) {
            bail!("{reason}");
        }
        bail!("failed to create session (server did not start)");
    }
    let _ = std::fs::remove_file(&err_path);

    if !quiet {
        eprintln!("[roost: created {name:?} ({} to detach)]", keys.label());
    }

    client::attach(
        name,
        AttachOptions {
            quiet,
            suppress_attached: true,
            keys,
        },
    )
    .await?;
    Ok(())
}

fn consume_error_file(path: &PathBuf) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    if data.is_empty() {
        return None;
    }
    let _ = std::fs::remove_file(path);
    Some(String::from_utf8_lossy(&data).into_owned())
}

fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

// ── Plumbing commands ───────────────────────────────────────────────

fn cmd_list() -> anyhow::Result<()> {
    let sessions = registry::list()?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}\t{}\t{}",
            session.name,
            format_relative(session.last_active),
            session.command_display()
        );
    }
    Ok(())
}

fn cmd_delete(name: &str) -> anyhow::Result<()> {
    let session = registry::load(name)?;
    if registry::is_process_alive(session.pid) {
        unsafe {
            libc::kill(session.pid, libc::SIGTERM);
        }
    }
    registry::remove(name)?;
    println!("Session {name:?} deleted");
    Ok(())
}

fn cmd_clear() -> anyhow::Result<()> {
    let sessions = registry::list()?;
    if sessions.is_empty() {
        println!("No sessions to clear");
        return Ok(());
    }
    let count = sessions.len();
    for session in sessions {
        if registry::is_process_alive(session.pid) {
            unsafe {
                libc::kill(session.pid, libc::SIGTERM);
            }
        }
        registry::remove(&session.name)?;
        println!("Session {:?} deleted", session.name);
    }
    println!("Cleared {count} session(s)");
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────────

fn ensure_not_nested() -> anyhow::Result<()> {
    match std::env::var(SESSION_ENV) {
        Ok(name) if !name.is_empty() => Err(Error::Nested(name).into()),
        _ => Ok(()),
    }
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidName(name.to_string()).into());
    }
    Ok(())
}

/// Flags win over the environment; the environment over the default `~.`.
fn resolve_detach_keys(flags: &[String]) -> anyhow::Result<DetachKeys> {
    if !flags.is_empty() {
        return Ok(DetachKeys::parse_all(flags)?);
    }

    let mut specs = Vec::new();
    if let Ok(spec) = std::env::var(DETACH_KEY_ENV) {
        if !spec.is_empty() {
            specs.push(spec);
        }
    }
    for i in 1.. {
        match std::env::var(format!("{DETACH_KEY_ENV}_{i}")) {
            Ok(spec) if !spec.is_empty() => specs.push(spec),
            _ => break,
        }
    }

    if specs.is_empty() {
        Ok(DetachKeys::default())
    } else {
        Ok(DetachKeys::parse_all(&specs)?)
    }
}

/// Session name from the working directory, suffixed until free.
fn generate_session_name() -> String {
    let base = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "session".to_string());

    if !registry::session_exists(&base) {
        return base;
    }
    for i in 1..1000 {
        let candidate = format!("{base}-{i}");
        if !registry::session_exists(&candidate) {
            return candidate;
        }
    }
    base
}

fn format_relative(t: chrono::DateTime<chrono::Utc>) -> String {
    let secs = (chrono::Utc::now() - t).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86400),
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
