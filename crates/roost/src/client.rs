//! Attach client: bridges the controlling terminal to a session daemon.
//!
//! The terminal goes raw for the duration of the attachment and is restored
//! on every exit path. Input flows through the detach automaton before being
//! forwarded; output is written verbatim to the primary screen so the host
//! terminal's scrollback keeps working.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;

use crate::detach::{DetachKeys, DetachScanner, Scan};
use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame, Frame};
use crate::registry;
use crate::term::{window_size, RawModeGuard};

/// Client input read chunk.
const INPUT_CHUNK: usize = 1024;

#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub quiet: bool,
    /// Skip the "attached" notice; used when chained right after create.
    pub suppress_attached: bool,
    pub keys: DetachKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The user hit a detach key; the session keeps running.
    Detached,
    /// The server reported the hosted child exited.
    Ended,
    /// The connection dropped or the client was signalled; leave quietly.
    Disconnected,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Attach the controlling terminal to the named session. Returns once the
/// user detaches, the session ends, or the connection drops; all of these
/// are successful completions.
pub async fn attach(name: &str, opts: AttachOptions) -> Result<()> {
    if !registry::session_exists(name) {
        return Err(Error::NotFound(name.to_string()));
    }

    let sock = registry::socket_path(name)?;
    let stream = UnixStream::connect(&sock)
        .await
        .map_err(|e| Error::Protocol(format!("failed to connect to session: {e}")))?;

    if !opts.quiet && !opts.suppress_attached {
        eprintln!(
            "[roost: attached {name:?} ({} to detach)]",
            opts.keys.label()
        );
    }

    // Raw mode holds until this guard drops; failure here is fatal before
    // any bytes are exchanged.
    let mut raw = RawModeGuard::new(libc::STDIN_FILENO)?;

    let (reader, writer) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let scanner = Arc::new(Mutex::new(DetachScanner::new(opts.keys.clone())));

    send_window_size(&writer).await;

    let outcome = tokio::select! {
        outcome = output_loop(reader, Arc::clone(&scanner)) => outcome,
        outcome = input_loop(Arc::clone(&writer), Arc::clone(&scanner)) => outcome,
        _ = winch_loop(Arc::clone(&writer)) => Outcome::Disconnected,
        _ = terminate_signal() => Outcome::Disconnected,
    };

    raw.restore();
    match outcome {
        Outcome::Detached if !opts.quiet => {
            eprintln!("\n[roost: detached {name:?}]");
        }
        Outcome::Ended if !opts.quiet => {
            eprintln!("\n[roost: ended {name:?}]");
        }
        _ => {}
    }
    Ok(())
}

/// Renders server output and watches for the end-of-session notice.
async fn output_loop(mut reader: OwnedReadHalf, scanner: Arc<Mutex<DetachScanner>>) -> Outcome {
    let mut stdout = tokio::io::stdout();
    loop {
        match read_frame(&mut reader).await {
            Ok(Frame::Output(data)) => {
                if stdout.write_all(&data).await.is_err() {
                    return Outcome::Disconnected;
                }
                let _ = stdout.flush().await;
                scanner.lock().await.note_output(&data);
            }
            Ok(Frame::Exit) => return Outcome::Ended,
            Ok(_) => {}
            Err(_) => return Outcome::Disconnected,
        }
    }
}

/// Forwards terminal input through the detach automaton.
async fn input_loop(writer: SharedWriter, scanner: Arc<Mutex<DetachScanner>>) -> Outcome {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; INPUT_CHUNK];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return Outcome::Disconnected,
            Ok(n) => n,
        };

        let mut emitted = Vec::with_capacity(n);
        let verdict = scanner.lock().await.scan(&buf[..n], &mut emitted);

        // Bytes scanned off before a detach match still belong to the PTY.
        if !emitted.is_empty() {
            let mut w = writer.lock().await;
            if write_frame(&mut *w, &Frame::Input(emitted)).await.is_err() {
                return Outcome::Disconnected;
            }
        }
        if verdict == Scan::Detach {
            return Outcome::Detached;
        }
    }
}

/// Propagates window-size changes for as long as the attachment lives.
async fn winch_loop(writer: SharedWriter) {
    let Ok(mut winch) = signal(SignalKind::window_change()) else {
        std::future::pending::<()>().await;
        return;
    };
    loop {
        winch.recv().await;
        send_window_size(&writer).await;
    }
}

async fn terminate_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

async fn send_window_size(writer: &SharedWriter) {
    if let Some((rows, cols)) = window_size(libc::STDIN_FILENO) {
        let mut w = writer.lock().await;
        let _ = write_frame(&mut *w, &Frame::Resize { rows, cols }).await;
    }
}
