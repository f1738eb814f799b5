//! The session manager.
//!
//! A [`Connection`] owns at most one WebSocket to the scoreboard server and
//! keeps a [`StateStore`] mirror of everything the server has sent. Each open
//! socket gets three tasks:
//!
//! - a writer that owns the sink and drains the outbound channel
//! - a read loop that applies `{"state": {...}}` frames to the store and
//!   flushes pending registrations after every frame
//! - a keepalive supervisor (see [`crate::keepalive`])
//!
//! Tasks hold only a weak handle and compare their socket id against the
//! active one before acting, so callbacks from a torn-down socket are no-ops.
//! There is no automatic reconnect: whoever observes a failure calls
//! [`Connection::connect`] again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConnectionConfig, Source};
use crate::error::{SessionError, SocketId};
use crate::json::JsonValue;
use crate::keepalive::{self, KeepaliveTracker, ProbeOutcome};
use crate::path::{PathComponent, StatePath};
use crate::protocol::{ChangeKind, Command, StateFrame};
use crate::registration::Registrations;
use crate::snapshot::Snapshot;
use crate::store::{StateStore, StoreEvent};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound messages buffered per socket before sends start failing.
const OUTBOUND_CAPACITY: usize = 256;

pub const DEVICE_NAME_PATH: &str = "WS.Device.Name";
pub const CURRENT_GAME_PATH: &str = "ScoreBoard.CurrentGame.Game";

/// Read on every connect so the server starts sending them.
pub const WARM_UP_PATHS: &[&str] = &[
    DEVICE_NAME_PATH,
    "WS.Device.Id",
    "WS.Client.RemoteAddress",
    CURRENT_GAME_PATH,
    "ScoreBoard.Version(release)",
    "ScoreBoard.Clients.Device(*).Comment",
];

pub type FailureHandler = Arc<dyn Fn() + Send + Sync>;

/// Result of [`Connection::get_or_subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    /// The last value the server confirmed, if any.
    pub value: Option<JsonValue>,
    /// True when the path was not yet registered and a registration has been
    /// queued; a fresher value will arrive as a change event.
    pub pending: bool,
}

struct ActiveSession {
    id: SocketId,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

struct Inner {
    config: RwLock<ConnectionConfig>,
    store: StateStore,
    session: Mutex<Option<ActiveSession>>,
    registrations: Mutex<Registrations>,
    pending_writes: Mutex<VecDeque<Command>>,
    keepalive: Mutex<KeepaliveTracker>,
    failure_handler: RwLock<Option<FailureHandler>>,
    error: watch::Sender<Option<SessionError>>,
    device_name: watch::Sender<Option<String>>,
    current_game: watch::Sender<Option<Uuid>>,
    connect_lock: tokio::sync::Mutex<()>,
    next_socket: AtomicU64,
    flush_scheduled: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

/// Handle to one scoreboard session. Clones share the same session and
/// mirror; pass it explicitly to whatever needs synchronized state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle held by per-socket tasks.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<Inner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let keepalive = KeepaliveTracker::new(config.keepalive.clone());
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                store: StateStore::new(),
                session: Mutex::new(None),
                registrations: Mutex::new(Registrations::new()),
                pending_writes: Mutex::new(VecDeque::new()),
                keepalive: Mutex::new(keepalive),
                failure_handler: RwLock::new(None),
                error: watch::channel(None).0,
                device_name: watch::channel(None).0,
                current_game: watch::channel(None).0,
                connect_lock: tokio::sync::Mutex::new(()),
                next_socket: AtomicU64::new(0),
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// A connection with no host. `connect` always fails with
    /// [`SessionError::NoConnection`].
    pub fn offline() -> Self {
        Self::new(ConnectionConfig::offline())
    }

    /// An offline connection whose mirror is loaded from a saved snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let connection = Self::offline();
        connection.load_snapshot(snapshot);
        connection
    }

    fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn config(&self) -> ConnectionConfig {
        self.inner.config.read().clone()
    }

    /// Call `handler` when keepalive gives up on the active socket.
    pub fn on_failure<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.failure_handler.write() = Some(Arc::new(handler));
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn socket_id(&self) -> Option<SocketId> {
        self.inner.session.lock().as_ref().map(|s| s.id)
    }

    fn is_active(&self, socket: SocketId) -> bool {
        self.socket_id() == Some(socket)
    }

    // ── Published fields ───────────────────────────────────────────

    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.error.borrow().clone()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<SessionError>> {
        self.inner.error.subscribe()
    }

    /// What the server calls this device.
    pub fn device_name(&self) -> Option<String> {
        self.inner.device_name.borrow().clone()
    }

    pub fn current_game(&self) -> Option<Uuid> {
        *self.inner.current_game.borrow()
    }

    pub fn watch_current_game(&self) -> watch::Receiver<Option<Uuid>> {
        self.inner.current_game.subscribe()
    }

    /// `ScoreBoard.Game(<id>)` for the current game, once known.
    pub fn current_game_path(&self) -> Option<StatePath> {
        self.current_game().map(|id| {
            StatePath::parse("ScoreBoard").adding(PathComponent::Identified("Game".into(), id))
        })
    }

    pub fn asset_url(&self, path: &str) -> Option<String> {
        self.inner.config.read().asset_url(path)
    }

    fn record_error(&self, error: SessionError) {
        self.inner.error.send_replace(Some(error));
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Open the socket if there isn't one. Idempotent.
    ///
    /// On success the keepalive supervisor and read loop are running and the
    /// warm-up paths, any earlier pending registrations, and queued writes
    /// have been sent.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _guard = self.inner.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Body of [`Connection::connect`]; the caller holds `connect_lock`.
    async fn connect_locked(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }

        let url = self.inner.config.read().websocket_url(self.current_game());
        let Some(url) = url else {
            let err = SessionError::NoConnection("no host configured".into());
            self.record_error(err.clone());
            return Err(err);
        };

        let timeout = self.inner.config.read().connect_timeout();
        let ws_stream =
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await
            {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => {
                    tracing::debug!(%url, error = %e, "connection failed");
                    let err = SessionError::NoConnection(format!("{url}: {e}"));
                    self.record_error(err.clone());
                    return Err(err);
                }
                Err(_) => {
                    tracing::debug!(%url, ?timeout, "connection timed out");
                    let err = SessionError::NoConnection(format!("{url}: timed out"));
                    self.record_error(err.clone());
                    return Err(err);
                }
            };

        let id = self.inner.next_socket.fetch_add(1, Ordering::Relaxed) + 1;
        let (sink, stream) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (pong_tx, pong_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let timing = self.inner.config.read().keepalive.clone();

        tokio::spawn(write_loop(
            self.downgrade(),
            id,
            sink,
            outbound_rx,
            cancel.clone(),
        ));
        tokio::spawn(keepalive::supervise(
            self.downgrade(),
            id,
            outbound.clone(),
            pong_rx,
            cancel.clone(),
            timing,
        ));

        {
            // Queued writes go out before any write made once the session is
            // visible to `set`.
            let mut session = self.inner.session.lock();
            let active = session.insert(ActiveSession {
                id,
                outbound: outbound.clone(),
                cancel: cancel.clone(),
            });
            self.inner.registrations.lock().forget_registered();
            self.inner.error.send_replace(None);
            for path in WARM_UP_PATHS {
                self.get_or_subscribe(&StatePath::parse(path));
            }
            self.send_registrations(active);
            self.send_pending_writes(active);
        }
        tracing::info!(socket = id, %url, "connected to scoreboard");

        tokio::spawn(read_loop(
            self.downgrade(),
            id,
            stream,
            outbound,
            pong_tx,
            cancel,
        ));
        Ok(())
    }

    /// Close the active socket. The mirror is kept.
    pub fn disconnect(&self) {
        if let Some(active) = self.inner.session.lock().take() {
            active.cancel.cancel();
            tracing::info!(socket = active.id, "disconnected");
        }
    }

    fn teardown_if_active(&self, socket: SocketId) -> bool {
        let mut session = self.inner.session.lock();
        match session.as_ref() {
            Some(active) if active.id == socket => {
                if let Some(active) = session.take() {
                    active.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    fn clear_view(&self) {
        self.disconnect();
        self.inner.store.clear();
        self.inner.registrations.lock().clear();
        self.inner.pending_writes.lock().clear();
    }

    /// Drop the socket and everything mirrored from it.
    pub fn reset(&self) {
        self.clear_view();
        self.inner.device_name.send_replace(None);
        self.inner.current_game.send_replace(None);
    }

    /// Apply `change` to the config, drop the current view, and reconnect.
    /// Holding `connect_lock` throughout keeps an in-flight connect from
    /// installing a socket opened for the old view.
    async fn switch_view<F>(&self, change: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut ConnectionConfig),
    {
        let _guard = self.inner.connect_lock.lock().await;
        change(&mut *self.inner.config.write());
        self.clear_view();
        self.connect_locked().await
    }

    /// Switch to a different server view. This is a cold resync: the mirror
    /// and subscriptions are dropped and a new socket is opened.
    pub async fn set_source(&self, source: Source) -> Result<(), SessionError> {
        self.switch_view(|config| config.source = source).await
    }

    pub async fn set_operator(&self, operator: Option<String>) -> Result<(), SessionError> {
        self.switch_view(|config| config.operator = operator).await
    }

    /// Edit a team instead of acting as an operator.
    pub async fn set_team_editing(&self, team: Option<String>) -> Result<(), SessionError> {
        self.switch_view(|config| config.set_team(team)).await
    }

    // ── Reads and registration ─────────────────────────────────────

    /// The mirrored value at `path`, registering the path with the server if
    /// this socket has not done so yet.
    pub fn get_or_subscribe(&self, path: &StatePath) -> Lookup {
        let pending = !self.inner.registrations.lock().is_registered(path);
        if pending {
            self.register([path.clone()]);
        }
        Lookup {
            value: self.inner.store.get(path),
            pending,
        }
    }

    /// Never waits for the network. If the value is not mirrored yet, await
    /// a change event from [`Connection::subscribe`].
    pub fn fetch(&self, path: &StatePath) -> Option<JsonValue> {
        self.get_or_subscribe(path).value
    }

    /// Queue paths for registration. Requests made before the next scheduler
    /// tick go out together in a single `Register` command.
    pub fn register<I>(&self, paths: I)
    where
        I: IntoIterator<Item = StatePath>,
    {
        let mut queued = false;
        {
            let mut registrations = self.inner.registrations.lock();
            for path in paths {
                queued |= registrations.request(&path);
            }
        }
        if queued {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Nothing to run the flush on; the next connect or frame will.
            self.inner.flush_scheduled.store(false, Ordering::Release);
            return;
        };
        let weak = self.downgrade();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(connection) = weak.upgrade() {
                connection.inner.flush_scheduled.store(false, Ordering::Release);
                connection.flush_registrations();
            }
        });
    }

    /// Send every pending registration in one command. Without a socket the
    /// paths stay pending. Returns true if a command was sent.
    pub fn flush_registrations(&self) -> bool {
        let session = self.inner.session.lock();
        match session.as_ref() {
            Some(active) => self.send_registrations(active),
            None => false,
        }
    }

    fn send_registrations(&self, active: &ActiveSession) -> bool {
        let mut registrations = self.inner.registrations.lock();
        let Some(paths) = registrations.take_batch() else {
            return false;
        };
        tracing::debug!(socket = active.id, count = paths.len(), "registering paths");
        let command = Command::register(paths);
        if send_command(active, &command) {
            return true;
        }
        if let Command::Register { paths } = command {
            registrations.requeue(paths);
        }
        false
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Ask the server to change a value. The mirror is not touched; the new
    /// value shows up when the server echoes it back.
    ///
    /// Without a socket the command waits in a bounded queue that is flushed
    /// on the next connect.
    pub fn set(&self, path: StatePath, value: JsonValue, kind: ChangeKind) {
        let command = Command::set(path, value, kind);
        let capacity = self.inner.config.read().pending_write_capacity;
        // Queue under the session guard so a concurrent connect either sees
        // the write in its flush or is already installed to take it directly.
        let session = self.inner.session.lock();
        match session.as_ref() {
            Some(active) => {
                let backlog = !self.inner.pending_writes.lock().is_empty();
                if backlog || !send_command(active, &command) {
                    self.queue_write(command, capacity);
                    self.send_pending_writes(active);
                }
            }
            None => self.queue_write(command, capacity),
        }
    }

    fn queue_write(&self, command: Command, capacity: usize) {
        if capacity == 0 {
            tracing::debug!(?command, "not connected, dropping write");
            return;
        }
        let mut queue = self.inner.pending_writes.lock();
        if queue.len() >= capacity {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(?dropped, "pending write queue full, dropping oldest");
            }
        }
        queue.push_back(command);
    }

    /// Number of writes waiting for a socket.
    pub fn pending_write_count(&self) -> usize {
        self.inner.pending_writes.lock().len()
    }

    fn send_pending_writes(&self, active: &ActiveSession) {
        let mut queue = self.inner.pending_writes.lock();
        while let Some(command) = queue.pop_front() {
            if !send_command(active, &command) {
                // Keep it and everything after it for the next flush.
                queue.push_front(command);
                break;
            }
        }
    }

    // ── Change notification ────────────────────────────────────────

    pub fn subscribe(&self) -> impl Stream<Item = StoreEvent> {
        self.inner.store.subscribe()
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn save_snapshot(&self) -> Snapshot {
        Snapshot::from_store(&self.inner.store)
    }

    /// Replace the mirror with a snapshot's contents.
    pub fn load_snapshot(&self, snapshot: &Snapshot) {
        self.inner.store.clear();
        for (path, value) in snapshot.entries() {
            self.update_published(&path, &value);
            self.inner.store.set(path, value);
        }
    }

    // ── Socket callbacks ───────────────────────────────────────────

    fn ingest(&self, socket: SocketId, text: &str) {
        if !self.is_active(socket) {
            tracing::debug!(socket, "ignoring frame from inactive socket");
            return;
        }
        match StateFrame::decode(text) {
            Ok(frame) => {
                let batch: Vec<(StatePath, JsonValue)> = frame.into_paths().collect();
                for (path, value) in &batch {
                    self.update_published(path, value);
                }
                let changes = self.inner.store.apply(batch);
                tracing::trace!(socket, changes = changes.len(), "applied state frame");
            }
            Err(e) => {
                let err = SessionError::Decode(e.to_string());
                tracing::warn!(socket, error = %err, "discarding malformed frame");
            }
        }
        self.flush_registrations();
    }

    fn update_published(&self, path: &StatePath, value: &JsonValue) {
        match path.to_string().as_str() {
            DEVICE_NAME_PATH => {
                self.inner
                    .device_name
                    .send_replace(value.as_str().map(str::to_owned));
            }
            CURRENT_GAME_PATH => {
                if let Some(id) = value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    self.inner.current_game.send_replace(Some(id));
                }
            }
            _ => {}
        }
    }

    fn transport_failed(&self, socket: SocketId, error: SessionError) {
        if self.teardown_if_active(socket) {
            tracing::warn!(socket, error = %error, "socket failed");
            self.record_error(error);
        }
    }

    pub(crate) fn record_probe(&self, socket: SocketId, ok: bool) -> ProbeOutcome {
        let (outcome, failures) = {
            let mut tracker = self.inner.keepalive.lock();
            let outcome = tracker.record(socket, ok);
            (outcome, tracker.failures(socket))
        };
        match outcome {
            ProbeOutcome::Next(_) if !ok => {
                tracing::debug!(socket, failures, "keepalive probe failed");
            }
            ProbeOutcome::Next(_) => {}
            ProbeOutcome::Escalate { failures } => {
                if self.teardown_if_active(socket) {
                    tracing::warn!(socket, failures, "keepalive failed, tearing down socket");
                    self.record_error(SessionError::KeepaliveFailure { socket, failures });
                    let handler = self.inner.failure_handler.read().clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
            }
        }
        outcome
    }

    pub(crate) fn forget_probes(&self, socket: SocketId) {
        self.inner.keepalive.lock().forget(socket);
    }
}

fn send_command(active: &ActiveSession, command: &Command) -> bool {
    let text = match command.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode command");
            return false;
        }
    };
    tracing::trace!(socket = active.id, %text, "sending");
    match active.outbound.try_send(Message::Text(text.into())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(socket = active.id, "outbound channel full");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(socket = active.id, "outbound channel closed (writer exited)");
            false
        }
    }
}

async fn write_loop(
    connection: WeakConnection,
    socket: SocketId,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    if let Some(connection) = connection.upgrade() {
                        connection.transport_failed(socket, SessionError::Transport(e.to_string()));
                    }
                    break;
                }
            }
        }
    }
    tracing::debug!(socket, "writer stopped");
}

async fn read_loop(
    connection: WeakConnection,
    socket: SocketId,
    mut stream: SplitStream<WsStream>,
    outbound: mpsc::Sender<Message>,
    pongs: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        let Some(connection) = connection.upgrade() else {
            break;
        };
        match msg {
            Some(Ok(Message::Text(text))) => connection.ingest(socket, text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => connection.ingest(socket, text),
                Err(e) => {
                    tracing::warn!(socket, error = %e, "discarding non-UTF-8 frame");
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = outbound.try_send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {
                pongs.send_modify(|n| *n += 1);
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                connection.transport_failed(
                    socket,
                    SessionError::Transport("connection closed by server".into()),
                );
                break;
            }
            Some(Err(e)) => {
                connection.transport_failed(socket, SessionError::Transport(e.to_string()));
                break;
            }
        }
    }
    tracing::debug!(socket, "read loop stopped");
}
