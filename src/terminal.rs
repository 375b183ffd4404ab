//! Live terminal sessions.
//!
//! Each session pairs one pty-backed shell with one websocket and is driven
//! by its own task. The manager only keeps a registry of what is running so
//! sessions can be listed, closed one at a time, or torn down on shutdown.
//!
//! Session lifecycle:
//! - `Active`: bytes flow both ways, control frames are honoured.
//! - `Closing`: a trigger fired (process exit, peer close, close request or
//!   shutdown). Output is dropped and the counterpart is being released.
//! - `Closed`: both sides released and the entry is gone from the registry.

use crate::protocol::{ClientFrame, ControlMessage, ServerFrame};
use crate::pty::{ExitInfo, ExitWaiter, PtyProcess, PtySpawner, SpawnedPty, TerminalSize};
use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for shells to exit before killing them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const TERMINATE_WAIT: Duration = Duration::from_secs(3);
const KILL_WAIT: Duration = Duration::from_secs(1);
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
const READ_BUFFER: usize = 8192;
const CHANNEL_CAPACITY: usize = 256;
/// Input held for a shell that is not reading; beyond this it is dropped.
const PENDING_INPUT_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionSignal {
    /// Hang up the shell and close once it exits.
    Terminate,
    /// Kill the shell now.
    Kill,
}

struct SessionEntry {
    created_at: Instant,
    pid: Option<u32>,
    size: TerminalSize,
    state: SessionState,
    signals: mpsc::UnboundedSender<SessionSignal>,
    abort: Option<AbortHandle>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub age_secs: u64,
}

/// Outcome of [`TerminalManager::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub graceful: usize,
    pub forced: usize,
}

/// Owns the live-session registry. Cheap to clone.
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    removed: Notify,
    spawner: Arc<dyn PtySpawner>,
    cwd: PathBuf,
    shutting_down: AtomicBool,
}

impl TerminalManager {
    pub fn new(spawner: Arc<dyn PtySpawner>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                removed: Notify::new(),
                spawner,
                cwd: cwd.into(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Run a session on an upgraded socket until either side ends it.
    ///
    /// No session is created when the shell cannot be spawned or shutdown has
    /// started; the client gets an `error` frame and the socket is closed.
    pub async fn attach(&self, socket: WebSocket, size: TerminalSize) {
        if self.is_shutting_down() {
            reject(socket, "agent is shutting down").await;
            return;
        }

        let spawner = self.inner.spawner.clone();
        let cwd = self.inner.cwd.clone();
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&cwd, size)).await;
        let pty = match spawned {
            Ok(Ok(pty)) => pty,
            Ok(Err(err)) => {
                warn!(error = %err, "failed to spawn terminal shell");
                reject(socket, &format!("failed to spawn shell: {err}")).await;
                return;
            }
            Err(err) => {
                error!(error = %err, "terminal spawn task failed");
                reject(socket, "failed to spawn shell").await;
                return;
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let pid = pty.process.pid();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.inner.sessions.write().await;
            if self.is_shutting_down() {
                drop(sessions);
                let SpawnedPty {
                    process, waiter, ..
                } = pty;
                drop(process);
                tokio::task::spawn_blocking(waiter);
                reject(socket, "agent is shutting down").await;
                return;
            }
            sessions.insert(
                id.clone(),
                SessionEntry {
                    created_at: Instant::now(),
                    pid,
                    size,
                    state: SessionState::Active,
                    signals: signals_tx,
                    abort: None,
                },
            );
        }
        info!(
            session_id = %id,
            pid = ?pid,
            cols = size.cols,
            rows = size.rows,
            "terminal session opened"
        );

        let SpawnedPty {
            process,
            reader,
            writer,
            waiter,
        } = pty;
        let session = Session {
            id: id.clone(),
            manager: self.clone(),
            socket,
            process,
            state: SessionState::Active,
            kill_at: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            peer_closed: false,
        };
        let task = tokio::spawn(session.run(reader, writer, waiter, signals_rx));
        self.update(&id, |entry| entry.abort = Some(task.abort_handle()))
            .await;

        match task.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                warn!(session_id = %id, "terminal session aborted");
            }
            Err(err) => {
                error!(session_id = %id, error = %err, "terminal session panicked");
            }
        }
        self.remove(&id).await;
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.read().await;
        let mut list: Vec<_> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                pid: entry.pid,
                cols: entry.size.cols,
                rows: entry.size.rows,
                state: entry.state,
                age_secs: entry.created_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Ask one session to hang up its shell. False if `id` is not live.
    pub async fn close(&self, id: &str) -> bool {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(id) {
            Some(entry) => {
                info!(session_id = id, "closing terminal session on request");
                let _ = entry.signals.send(SessionSignal::Terminate);
                true
            }
            None => false,
        }
    }

    /// Terminate every session, wait up to `grace` for them to finish, then
    /// kill and abort whatever is left. Never waits much longer than `grace`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let total = {
            let sessions = self.inner.sessions.read().await;
            for entry in sessions.values() {
                let _ = entry.signals.send(SessionSignal::Terminate);
            }
            sessions.len()
        };
        if total == 0 {
            return ShutdownReport::default();
        }
        info!(
            sessions = total,
            grace_secs = grace.as_secs(),
            "terminating terminal sessions"
        );

        if tokio::time::timeout(grace, self.wait_until_empty()).await.is_ok() {
            info!(sessions = total, "all terminal sessions exited");
            return ShutdownReport {
                graceful: total,
                forced: 0,
            };
        }

        let stragglers: Vec<(String, Option<AbortHandle>)> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .iter()
                .map(|(id, entry)| {
                    let _ = entry.signals.send(SessionSignal::Kill);
                    (id.clone(), entry.abort.clone())
                })
                .collect()
        };
        let forced = stragglers.len();
        warn!(sessions = forced, "force-terminating terminal sessions");

        if tokio::time::timeout(KILL_WAIT, self.wait_until_empty())
            .await
            .is_err()
        {
            for (id, abort) in stragglers {
                debug!(session_id = %id, "aborting terminal session task");
                if let Some(abort) = abort {
                    abort.abort();
                }
            }
        }
        ShutdownReport {
            graceful: total.saturating_sub(forced),
            forced,
        }
    }

    async fn wait_until_empty(&self) {
        loop {
            let notified = self.inner.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut SessionEntry)) {
        if let Some(entry) = self.inner.sessions.write().await.get_mut(id) {
            apply(entry);
        }
    }

    async fn remove(&self, id: &str) {
        if self.inner.sessions.write().await.remove(id).is_some() {
            info!(session_id = id, "terminal session closed");
        }
        self.inner.removed.notify_waiters();
    }
}

/// Send an `error` frame and close without creating a session.
async fn reject(mut socket: WebSocket, message: &str) {
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    if let Ok(text) = frame.encode() {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

enum Ending {
    ProcessExited(ExitInfo),
    ConnectionClosed,
}

struct Session {
    id: String,
    manager: TerminalManager,
    socket: WebSocket,
    process: Box<dyn PtyProcess>,
    state: SessionState,
    /// Set once the shell has been asked to hang up.
    kill_at: Option<tokio::time::Instant>,
    /// Input waiting for room in the pty writer.
    pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    /// The client sent a close frame.
    peer_closed: bool,
}

impl Session {
    async fn run(
        mut self,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        waiter: ExitWaiter,
        mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    ) {
        let (output_tx, mut output_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || pump_output(reader, output_tx));
        tokio::task::spawn_blocking(move || pump_input(writer, input_rx));
        let mut exit = tokio::task::spawn_blocking(waiter);

        let connected = ServerFrame::Connected {
            session_id: self.id.clone(),
            cwd: self.manager.inner.cwd.display().to_string(),
            platform: std::env::consts::OS,
        };
        let ending = if self.send_frame(&connected).await {
            self.event_loop(&mut signals, &mut output_rx, &input_tx, &mut exit)
                .await
        } else {
            Ending::ConnectionClosed
        };
        drop(input_tx);

        match ending {
            Ending::ProcessExited(info) => self.finish_exited(info, &mut output_rx).await,
            Ending::ConnectionClosed => self.finish_disconnected(&mut exit).await,
        }
        self.set_state(SessionState::Closed).await;
    }

    async fn event_loop(
        &mut self,
        signals: &mut mpsc::UnboundedReceiver<SessionSignal>,
        output: &mut mpsc::Receiver<Vec<u8>>,
        input: &mpsc::Sender<Vec<u8>>,
        exit: &mut JoinHandle<io::Result<ExitInfo>>,
    ) -> Ending {
        loop {
            let kill_at = self.kill_at;
            tokio::select! {
                Some(signal) = signals.recv() => self.on_signal(signal).await,
                frame = self.socket.recv(), if self.state == SessionState::Active => {
                    match frame {
                        Some(Ok(message)) => {
                            if !self.on_message(message).await {
                                return Ending::ConnectionClosed;
                            }
                        }
                        Some(Err(err)) => {
                            debug!(session_id = %self.id, error = %err, "websocket error");
                            return Ending::ConnectionClosed;
                        }
                        None => return Ending::ConnectionClosed,
                    }
                }
                Some(chunk) = output.recv() => {
                    if self.state == SessionState::Active
                        && !self.send(Message::Binary(chunk)).await
                    {
                        return Ending::ConnectionClosed;
                    }
                }
                permit = input.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(bytes) = self.pending.pop_front() {
                            self.pending_bytes -= bytes.len();
                            permit.send(bytes);
                        }
                    }
                    Err(_) => {
                        debug!(session_id = %self.id, "shell input closed, dropping bytes");
                        self.pending.clear();
                        self.pending_bytes = 0;
                    }
                },
                _ = sleep_until(kill_at), if kill_at.is_some() => {
                    warn!(session_id = %self.id, "shell ignored hangup, killing");
                    self.kill_at = None;
                    self.process.kill();
                }
                joined = &mut *exit => return Ending::ProcessExited(exit_info(joined)),
            }
        }
    }

    /// Returns false when the peer is gone.
    async fn on_message(&mut self, message: Message) -> bool {
        let payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                self.peer_closed = true;
                return false;
            }
            Message::Ping(_) | Message::Pong(_) => return true,
        };
        match ClientFrame::classify(payload) {
            ClientFrame::Input(bytes) => {
                self.queue_input(bytes);
                true
            }
            ClientFrame::Control(ControlMessage::Ping) => {
                self.send_frame(&ServerFrame::Pong).await
            }
            ClientFrame::Control(ControlMessage::Resize { cols, rows }) => {
                self.resize(TerminalSize { cols, rows }).await;
                true
            }
            ClientFrame::Ignored => {
                debug!(session_id = %self.id, "ignoring malformed control frame");
                true
            }
        }
    }

    fn queue_input(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if self.pending_bytes + bytes.len() > PENDING_INPUT_LIMIT {
            debug!(
                session_id = %self.id,
                dropped = bytes.len(),
                "shell is not reading input, dropping bytes"
            );
            return;
        }
        self.pending_bytes += bytes.len();
        self.pending.push_back(bytes);
    }

    async fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Terminate => {
                if self.state == SessionState::Active {
                    self.set_state(SessionState::Closing).await;
                    self.process.terminate();
                    self.kill_at = Some(tokio::time::Instant::now() + TERMINATE_WAIT);
                }
            }
            SessionSignal::Kill => {
                self.set_state(SessionState::Closing).await;
                self.kill_at = None;
                self.process.kill();
            }
        }
    }

    async fn resize(&mut self, size: TerminalSize) {
        if let Err(err) = self.process.resize(size) {
            warn!(session_id = %self.id, error = %err, "resize failed");
            return;
        }
        self.manager.update(&self.id, |entry| entry.size = size).await;
        debug!(session_id = %self.id, cols = size.cols, rows = size.rows, "resized");
    }

    /// Flush trailing output, report the exit and close the socket.
    async fn finish_exited(&mut self, info: ExitInfo, output: &mut mpsc::Receiver<Vec<u8>>) {
        let was_active = self.state == SessionState::Active;
        self.set_state(SessionState::Closing).await;
        info!(
            session_id = %self.id,
            exit_code = ?info.exit_code,
            signal = ?info.signal,
            "terminal process exited"
        );
        if was_active {
            let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
            while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output.recv()).await {
                if !self.send(Message::Binary(chunk)).await {
                    return;
                }
            }
        }
        let frame = ServerFrame::Exit {
            exit_code: info.exit_code,
            signal: info.signal,
        };
        if self.send_frame(&frame).await {
            let _ = self.socket.send(Message::Close(None)).await;
        }
    }

    /// Hang up the shell, escalating to a kill if it lingers.
    async fn finish_disconnected(&mut self, exit: &mut JoinHandle<io::Result<ExitInfo>>) {
        if self.peer_closed {
            let _ = self.socket.send(Message::Close(None)).await;
        }
        self.set_state(SessionState::Closing).await;
        info!(session_id = %self.id, "terminal connection closed, terminating shell");
        self.process.terminate();
        if tokio::time::timeout(TERMINATE_WAIT, &mut *exit).await.is_ok() {
            return;
        }
        warn!(session_id = %self.id, "shell ignored hangup, killing");
        self.process.kill();
        if tokio::time::timeout(KILL_WAIT, &mut *exit).await.is_err() {
            warn!(
                session_id = %self.id,
                pid = ?self.process.pid(),
                "shell did not exit after kill"
            );
        }
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?state, "session state");
        self.state = state;
        self.manager.update(&self.id, |entry| entry.state = state).await;
    }

    async fn send_frame(&mut self, frame: &ServerFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.send(Message::Text(text)).await,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode frame");
                true
            }
        }
    }

    async fn send(&mut self, message: Message) -> bool {
        match self.socket.send(message).await {
            Ok(()) => true,
            Err(err) => {
                debug!(session_id = %self.id, error = %err, "websocket send failed");
                false
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn exit_info(joined: Result<io::Result<ExitInfo>, JoinError>) -> ExitInfo {
    match joined {
        Ok(Ok(info)) => info,
        Ok(Err(err)) => {
            warn!(error = %err, "waiting for shell failed");
            ExitInfo::default()
        }
        Err(err) => {
            warn!(error = %err, "shell wait task failed");
            ExitInfo::default()
        }
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the shell side of the pty is gone.
            Err(_) => break,
        }
    }
}

fn pump_input(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if let Err(err) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            debug!(error = %err, "pty write failed");
            break;
        }
    }
}
