//! Per-session daemon: owns the PTY and the listening socket, fans PTY
//! output out to every attached client, serializes client input into the
//! PTY, reconciles window sizes, and tears the session down when the hosted
//! child exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::protocol::{read_frame, Frame, MAX_FRAME_LEN};
use crate::pty::Pty;
use crate::registry::{self, Session};

/// PTY master read chunk.
const PTY_READ_CHUNK: usize = 32 * 1024;
/// Replay buffer cap; equals the protocol's frame cap so a snapshot always
/// fits in one `Output` frame.
const REPLAY_CAP: usize = MAX_FRAME_LEN;
/// How long an exiting session lingers for a first client to show up.
const EXIT_GRACE: Duration = Duration::from_secs(5);
const GRACE_TICK: Duration = Duration::from_millis(100);

// ── Replay buffer ───────────────────────────────────────────────────

/// Bounded tail of recent PTY output, trimmed from the front so the most
/// recent bytes survive. New clients receive a snapshot of it on attach.
pub struct ReplayBuffer {
    buf: std::collections::VecDeque<u8>,
    cap: usize,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: std::collections::VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }
}

// ── Server ──────────────────────────────────────────────────────────

struct ClientHandle {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    rows: u16,
    cols: u16,
}

pub struct Server {
    name: String,
    pty: Pty,
    clients: RwLock<HashMap<u64, ClientHandle>>,
    replay: Mutex<ReplayBuffer>,
    session: Mutex<Session>,
    pty_exited: AtomicBool,
    had_client: AtomicBool,
    done: AtomicBool,
    done_tx: watch::Sender<bool>,
    next_client_id: AtomicU64,
}

impl Server {
    /// Bring a session up: data dir, duplicate check, PTY, listener,
    /// descriptor. On failure every completed step is unwound in reverse.
    /// Returns the server and the bound listener.
    pub fn start(name: &str, command: &[String]) -> Result<(Arc<Server>, UnixListener)> {
        registry::ensure_data_dir()?;

        if registry::session_exists(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let pty = Pty::spawn(name, command)?;

        let sock = registry::socket_path(name)?;
        let listener = match UnixListener::bind(&sock) {
            Ok(listener) => listener,
            Err(e) => {
                pty.close();
                return Err(e.into());
            }
        };

        let session = Session::new(name, std::process::id() as i32, command.to_vec());
        if let Err(e) = registry::save(&session) {
            drop(listener);
            let _ = std::fs::remove_file(&sock);
            pty.close();
            return Err(e);
        }

        tracing::info!(
            name,
            pid = session.pid,
            child = pty.child_pid(),
            "session started"
        );

        let (done_tx, _) = watch::channel(false);
        let server = Arc::new(Server {
            name: name.to_string(),
            pty,
            clients: RwLock::new(HashMap::new()),
            replay: Mutex::new(ReplayBuffer::new(REPLAY_CAP)),
            session: Mutex::new(session),
            pty_exited: AtomicBool::new(false),
            had_client: AtomicBool::new(false),
            done: AtomicBool::new(false),
            done_tx,
            next_client_id: AtomicU64::new(1),
        });
        Ok((server, listener))
    }

    /// Run the accept loop and the background workers until shutdown.
    pub async fn run(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        let mut done_rx = self.done_tx.subscribe();

        let reader = tokio::spawn(Arc::clone(&self).pty_reader());
        tokio::spawn(Arc::clone(&self).child_waiter(reader));
        tokio::spawn(Arc::clone(&self).sigterm_watcher());
        loop {
            tokio::select! {
                _ = done_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(Arc::clone(&self).handle_client(stream));
                    }
                    Err(e) => {
                        if self.done.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        // Usually a no-op; covers the accept loop failing on its own.
        self.shutdown().await;
        Ok(())
    }

    /// Reads PTY output, appends it to the replay buffer and fans it out.
    ///
    /// The append and the fan-out run under the clients read lock, and the
    /// accept path registers + snapshots under the write lock, so a joining
    /// client sees each byte exactly once: either in its snapshot or in the
    /// following broadcasts, never both.
    async fn pty_reader(self: Arc<Self>) {
        let mut buf = vec![0u8; PTY_READ_CHUNK];
        loop {
            let n = match self.pty.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let chunk = &buf[..n];

            let clients = self.clients.read().await;
            self.replay.lock().await.push(chunk);
            let frame = Frame::Output(chunk.to_vec()).encode();
            for client in clients.values() {
                let mut writer = client.writer.lock().await;
                let _ = writer.write_all(&frame).await;
            }
        }
        tracing::debug!("pty reader finished");
    }

    /// Reaps the child, tells every client the session ended, lingers for a
    /// transient first client, then shuts the session down.
    async fn child_waiter(self: Arc<Self>, reader: tokio::task::JoinHandle<()>) {
        let code = self.pty.wait().await.unwrap_or(-1);
        // The exit notice goes out only after the last PTY bytes did.
        let _ = reader.await;

        tracing::info!(code, "child exited");
        self.pty_exited.store(true, Ordering::SeqCst);
        self.broadcast(&Frame::Exit).await;

        let ticks = EXIT_GRACE.as_millis() / GRACE_TICK.as_millis();
        for _ in 0..ticks {
            if self.had_client.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(GRACE_TICK).await;
        }
        // Let in-flight exit frames drain.
        tokio::time::sleep(GRACE_TICK).await;

        self.shutdown().await;
    }

    async fn sigterm_watcher(self: Arc<Self>) {
        let Ok(mut term) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        term.recv().await;
        tracing::info!("SIGTERM received");
        self.pty.kill(libc::SIGTERM);
        self.shutdown().await;
        std::process::exit(0);
    }

    /// One task per connection: register, replay, then pump frames.
    async fn handle_client(self: Arc<Self>, stream: UnixStream) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        // Register with an unknown size, then send the replay snapshot
        // before releasing the write lock (see pty_reader for why).
        {
            let mut clients = self.clients.write().await;
            let snapshot = self.replay.lock().await.snapshot();
            clients.insert(
                id,
                ClientHandle {
                    writer: Arc::clone(&writer),
                    rows: 0,
                    cols: 0,
                },
            );
            self.had_client.store(true, Ordering::SeqCst);
            if !snapshot.is_empty() {
                let frame = Frame::Output(snapshot).encode();
                let mut w = writer.lock().await;
                let _ = w.write_all(&frame).await;
            }
        }
        tracing::debug!(client = id, "client attached");

        self.touch_session().await;

        if self.pty_exited.load(Ordering::SeqCst) {
            let mut w = writer.lock().await;
            let _ = w.write_all(&Frame::Exit.encode()).await;
            drop(w);
            self.clients.write().await.remove(&id);
            return;
        }

        let mut done_rx = self.done_tx.subscribe();
        loop {
            let frame = tokio::select! {
                _ = done_rx.changed() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(client = id, error = %e, "client gone");
                        break;
                    }
                },
            };

            match frame {
                Frame::Input(data) => {
                    // Last writer wins: the active typist's terminal sets
                    // the PTY size, even without a fresh Resize.
                    let size = {
                        let clients = self.clients.read().await;
                        clients.get(&id).map(|c| (c.rows, c.cols))
                    };
                    if let Some((rows, cols)) = size {
                        self.pty.resize(rows, cols);
                    }
                    if self.pty.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Frame::Resize { rows, cols } => {
                    {
                        let mut clients = self.clients.write().await;
                        if let Some(client) = clients.get_mut(&id) {
                            client.rows = rows;
                            client.cols = cols;
                        }
                    }
                    self.pty.resize(rows, cols);
                }
                Frame::Output(_) | Frame::Exit | Frame::Unknown => {}
            }
        }

        // Hand the PTY size to whichever remaining client declared one.
        {
            let mut clients = self.clients.write().await;
            clients.remove(&id);
            if let Some(client) = clients.values().find(|c| c.rows > 0 && c.cols > 0) {
                self.pty.resize(client.rows, client.cols);
            }
        }
        tracing::debug!(client = id, "client detached");
    }

    /// Best-effort fan-out; a client whose write fails is cleaned up by its
    /// own reader task noticing the dead socket.
    async fn broadcast(&self, frame: &Frame) {
        let encoded = frame.encode();
        let clients = self.clients.read().await;
        for client in clients.values() {
            let mut writer = client.writer.lock().await;
            let _ = writer.write_all(&encoded).await;
        }
    }

    async fn touch_session(&self) {
        let snapshot = {
            let mut session = self.session.lock().await;
            session.last_active = Utc::now();
            session.clone()
        };
        if let Err(e) = registry::save(&snapshot) {
            tracing::warn!(error = %e, "failed to refresh descriptor");
        }
    }

    /// Idempotent teardown: flags the session done, wakes the accept loop,
    /// closes the PTY and every client connection, removes session files.
    pub async fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(name = %self.name, "shutting down");
        let _ = self.done_tx.send(true);

        self.pty.close();

        let mut clients = self.clients.write().await;
        for (_, client) in clients.drain() {
            let mut writer = client.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        drop(clients);

        let _ = registry::remove(&self.name);
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
