//! Shared Socket.IO connection with bounded auto-reconnect.
//!
//! [`Connection`] owns one WebSocket to the API server, speaking Engine.IO v4 /
//! Socket.IO framing (see [`codec`](crate::codec)). It is constructed without
//! connecting; [`Connection::connect`] starts a background transport task and
//! resolves once the namespace handshake completes.
//!
//! The transport task is the only owner of the socket. Outbound events reach it
//! through an unbounded channel; inbound events are decoded into
//! [`ServerEvent`]s and handed to every listener registered for that kind, in
//! registration order, on the transport task.
//!
//! Input emitted while not connected is buffered and flushed after the next
//! successful connect. Room membership (`session:join` / `session:leave`) is
//! reference-counted here so it can be re-established after a reconnect: on
//! every connect one `session:join` is sent per room with live subscriptions.
//! Offline join/leave only touch the counts; nothing is queued for them.
//! `disconnect()` writes out events already emitted before closing.
//!
//! On an unexpected drop the task reconnects with a doubling delay, up to
//! `reconnection_attempts` times, then parks in [`ConnectionState::Failed`]
//! until the next explicit `connect()`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Handshake, Packet, SocketPacket};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::protocol::{ClientEvent, ErrorEvent, EventKind, ServerEvent};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback invoked on the transport task for each matching inbound event.
pub type Listener = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Handle returned by [`Connection::on`], used to deregister that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Transport lifecycle as observed through [`Connection::watch_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed by `disconnect()` / the server.
    Disconnected,
    /// First open sequence in progress.
    Connecting,
    Connected,
    /// Waiting to retry after `last_error`; `attempt` counts from 1.
    Reconnecting {
        attempt: u32,
        last_error: ConnectionError,
    },
    /// Gave up; the next `connect()` starts over.
    Failed(ConnectionError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

/// Outbound side of the transport, guarded by one lock so that state
/// transitions, buffering, and room bookkeeping stay consistent.
struct Link {
    /// Live channel into the transport task while connected.
    sender: Option<mpsc::UnboundedSender<ClientEvent>>,
    /// Input emitted while not connected.
    outbox: VecDeque<ClientEvent>,
    /// Joined rooms and how many subscriptions hold each.
    rooms: BTreeMap<String, usize>,
    /// Cancels the running transport task, if any.
    shutdown: Option<CancellationToken>,
    /// Bumped on every start/stop; a task only publishes for its own generation.
    generation: u64,
}

struct Shared {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Listeners>,
    link: Mutex<Link>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops the transport when the last [`Connection`] clone is dropped.
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Cloneable handle to the shared transport.
#[derive(Clone)]
pub struct Connection {
    handle: Arc<Handle>,
}

impl Connection {
    /// Create the transport handle. Does not connect.
    pub fn new(config: ConnectionConfig) -> Self {
        let shared = Shared {
            config,
            state: watch::Sender::new(ConnectionState::Disconnected),
            listeners: Mutex::new(Listeners {
                next_id: 1,
                entries: Vec::new(),
            }),
            link: Mutex::new(Link {
                sender: None,
                outbox: VecDeque::new(),
                rooms: BTreeMap::new(),
                shutdown: None,
                generation: 0,
            }),
        };
        Self {
            handle: Arc::new(Handle {
                shared: Arc::new(shared),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// Connect (if needed) and wait until the transport is usable.
    ///
    /// Resolves immediately when already connected. Concurrent callers share
    /// one open sequence. Fails with the first connection error reported after
    /// the call; the transport keeps retrying in the background per the
    /// reconnection policy.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut rx = self.shared().state.subscribe();
        if rx.borrow_and_update().is_connected() {
            return Ok(());
        }

        self.start();

        loop {
            rx.changed().await.map_err(|_| ConnectionError::Closed)?;
            match &*rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Reconnecting { last_error, .. }
                | ConnectionState::Failed(last_error) => return Err(last_error.clone()),
                ConnectionState::Disconnected => return Err(ConnectionError::Closed),
                ConnectionState::Connecting => {}
            }
        }
    }

    /// Spawn the transport task unless one is already running.
    fn start(&self) {
        let shared = self.shared();
        let mut link = lock(&shared.link);
        if link.shutdown.is_some() {
            return;
        }
        let token = CancellationToken::new();
        link.shutdown = Some(token.clone());
        link.generation += 1;
        let generation = link.generation;
        shared.state.send_replace(ConnectionState::Connecting);
        drop(link);

        info!("Connecting to {}", shared.config.url);
        tokio::spawn(run_transport(Arc::clone(shared), generation, token));
    }

    /// Close the transport. No-op when nothing is running. The handle stays
    /// usable; a later [`connect`](Self::connect) opens a fresh socket.
    pub fn disconnect(&self) {
        if self.shared().shutdown() {
            info!("Disconnected from {}", self.shared().config.url);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared().state.borrow().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state.borrow().clone()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state.subscribe()
    }

    /// Send an event now if connected, otherwise buffer it for the next connect.
    pub fn emit(&self, event: ClientEvent) {
        let mut link = lock(&self.shared().link);

        match &event {
            ClientEvent::Join(id) => *link.rooms.entry(id.clone()).or_insert(0) += 1,
            ClientEvent::Leave(id) => {
                let remaining = link.rooms.get_mut(id).map(|count| {
                    *count = count.saturating_sub(1);
                    *count
                });
                if remaining == Some(0) {
                    link.rooms.remove(id);
                }
            }
            ClientEvent::Input { .. } => {}
        }

        let event = match &link.sender {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        // Room signals are replayed from `rooms` on connect.
        if matches!(event, ClientEvent::Input { .. }) {
            debug!("Buffering {} until connected", event.name());
            link.outbox.push_back(event);
        }
    }

    /// Register a listener for one inbound event kind.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let mut listeners = lock(&self.shared().listeners);
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push((id, kind, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared().listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry_id, _, _)| *entry_id != id);
        listeners.entries.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.shared().listeners)
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Rooms with at least one live join, in sorted order.
    pub fn rooms(&self) -> Vec<String> {
        lock(&self.shared().link).rooms.keys().cloned().collect()
    }

    /// Events waiting for the next connect.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> Vec<ClientEvent> {
        lock(&self.shared().link).outbox.iter().cloned().collect()
    }

    /// Feed an inbound event straight to the listeners, bypassing the socket.
    #[cfg(test)]
    pub(crate) fn dispatch(&self, event: &ServerEvent) {
        self.shared().dispatch(event);
    }
}

impl Shared {
    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        // Snapshot so listeners may (de)register from inside a callback.
        let targets: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in targets {
            listener(event);
        }
    }

    /// Cancel the running task and mark the connection closed. Returns `false`
    /// if there was nothing to stop.
    fn shutdown(&self) -> bool {
        let mut link = lock(&self.link);
        let Some(token) = link.shutdown.take() else {
            return false;
        };
        token.cancel();
        link.sender = None;
        link.generation += 1;
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    fn publish(&self, generation: u64, state: ConnectionState) {
        let link = lock(&self.link);
        if link.generation == generation {
            self.state.send_replace(state);
        }
    }

    /// Terminal transition for a task that is exiting on its own.
    fn finish(&self, generation: u64, state: ConnectionState) {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return;
        }
        link.shutdown = None;
        link.sender = None;
        self.state.send_replace(state);
    }

    /// Open the outbound channel and collect what must be sent first: one join
    /// per held room, then buffered input in emit order.
    fn go_live(
        &self,
        generation: u64,
    ) -> Option<(mpsc::UnboundedReceiver<ClientEvent>, Vec<ClientEvent>)> {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending: Vec<ClientEvent> = link
            .rooms
            .keys()
            .map(|id| ClientEvent::Join(id.clone()))
            .collect();
        pending.extend(link.outbox.drain(..));
        link.sender = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
        Some((rx, pending))
    }

    /// Close the outbound channel, moving anything not yet written back into the outbox.
    fn go_offline(
        &self,
        generation: u64,
        outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
        unsent: Vec<ClientEvent>,
    ) {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return;
        }
        link.sender = None;
        let queued = std::iter::from_fn(|| outbound.try_recv().ok());
        link.outbox.extend(
            unsent
                .into_iter()
                .chain(queued)
                .filter(|e| matches!(e, ClientEvent::Input { .. })),
        );
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Shutdown,
    /// The server disconnected the namespace; no reconnect.
    ServerDisconnect,
    /// The socket dropped; reconnect per policy.
    Dropped {
        error: ConnectionError,
        unsent: Vec<ClientEvent>,
    },
}

/// Build the Engine.IO WebSocket URL from the HTTP base URL.
pub fn build_socket_url(config: &ConnectionConfig) -> Result<String, ConnectionError> {
    let base = config.url.trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ConnectionError::InvalidUrl(config.url.clone()));
    };
    let path = config.path.trim_matches('/');
    Ok(format!("{ws_base}/{path}/?EIO=4&transport=websocket"))
}

/// Connect, serve, and reconnect until cancelled, disconnected by the server,
/// or out of attempts.
async fn run_transport(shared: Arc<Shared>, generation: u64, shutdown: CancellationToken) {
    let url = match build_socket_url(&shared.config) {
        Ok(url) => url,
        Err(e) => {
            warn!("{e}");
            shared.finish(generation, ConnectionState::Failed(e));
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        let opened = tokio::select! {
            () = shutdown.cancelled() => return,
            result = tokio::time::timeout(shared.config.connect_timeout(), open_socket(&url)) => {
                result.unwrap_or(Err(ConnectionError::Timeout))
            }
        };

        let error = match opened {
            Ok((ws, handshake)) => {
                let Some((mut outbound, pending)) = shared.go_live(generation) else {
                    return;
                };
                attempt = 0;
                info!("Connected to {} (sid {})", shared.config.url, handshake.sid);

                match run_session(&shared, ws, &handshake, &mut outbound, pending, &shutdown).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::ServerDisconnect => {
                        info!("Server closed the session channel");
                        shared.finish(generation, ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Dropped { error, unsent } => {
                        warn!("Connection lost: {error}");
                        shared.go_offline(generation, &mut outbound, unsent);
                        shared.dispatch(&ServerEvent::Error(ErrorEvent {
                            session_id: String::new(),
                            error: error.to_string(),
                        }));
                        error
                    }
                }
            }
            Err(e) => e,
        };

        if !shared.config.reconnection || attempt >= shared.config.reconnection_attempts {
            warn!("Giving up on {}: {error}", shared.config.url);
            shared.finish(generation, ConnectionState::Failed(error));
            return;
        }

        attempt += 1;
        let delay = shared.config.reconnect_delay(attempt);
        warn!(
            "Reconnect attempt {attempt}/{} in {}ms ({error})",
            shared.config.reconnection_attempts,
            delay.as_millis()
        );
        shared.publish(
            generation,
            ConnectionState::Reconnecting {
                attempt,
                last_error: error,
            },
        );

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// WebSocket handshake, Engine.IO open, Socket.IO namespace connect.
async fn open_socket(url: &str) -> Result<(WsStream, Handshake), ConnectionError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;

    let handshake = match next_packet(&mut ws).await? {
        Packet::Open(handshake) => handshake,
        other => {
            return Err(ConnectionError::Handshake(format!(
                "expected open packet, got {other:?}"
            )))
        }
    };

    send_packet(&mut ws, &Packet::Message(SocketPacket::Connect(None))).await?;

    loop {
        match next_packet(&mut ws).await? {
            Packet::Message(SocketPacket::Connect(_)) => return Ok((ws, handshake)),
            Packet::Message(SocketPacket::ConnectError(body)) => {
                let message = body["message"]
                    .as_str()
                    .map_or_else(|| body.to_string(), String::from);
                return Err(ConnectionError::Rejected(message));
            }
            Packet::Ping => send_packet(&mut ws, &Packet::Pong).await?,
            Packet::Pong | Packet::Noop => {}
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "unexpected packet before connect ack: {other:?}"
                )))
            }
        }
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, ConnectionError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return codec::decode(text.as_str())
                    .map_err(|e| ConnectionError::Handshake(e.to_string()))
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectionError::Transport(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
        }
    }
}

async fn send_packet<S>(sink: &mut S, packet: &Packet) -> Result<(), ConnectionError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = codec::encode(packet);
    debug!("-> {frame}");
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}

/// Write whatever was emitted before `disconnect()`, then send `41` and close.
async fn close_gracefully<S>(sink: &mut S, outbound: &mut mpsc::UnboundedReceiver<ClientEvent>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Ok(event) = outbound.try_recv() {
        if send_packet(&mut *sink, &Packet::Message(event.to_packet()))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = send_packet(&mut *sink, &Packet::Message(SocketPacket::Disconnect)).await;
    let _ = sink.close().await;
}

/// Serve one connected socket: flush `pending`, then pump outbound events,
/// dispatch inbound events, and answer heartbeats until something ends it.
async fn run_session(
    shared: &Shared,
    ws: WsStream,
    handshake: &Handshake,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    pending: Vec<ClientEvent>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    for (i, event) in pending.iter().enumerate() {
        if let Err(error) = send_packet(&mut sink, &Packet::Message(event.to_packet())).await {
            return SessionEnd::Dropped {
                error,
                unsent: pending[i..].to_vec(),
            };
        }
    }

    // No ping from the server within interval + timeout means the link is dead.
    let heartbeat = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
    let deadline = tokio::time::sleep(heartbeat);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                close_gracefully(&mut sink, outbound).await;
                return SessionEnd::Shutdown;
            }
            () = &mut deadline => {
                return SessionEnd::Dropped {
                    error: ConnectionError::Transport("ping timeout".into()),
                    unsent: Vec::new(),
                };
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    // Sender dropped by disconnect(); the token fires too.
                    close_gracefully(&mut sink, outbound).await;
                    return SessionEnd::Shutdown;
                };
                if let Err(error) = send_packet(&mut sink, &Packet::Message(event.to_packet())).await {
                    return SessionEnd::Dropped { error, unsent: vec![event] };
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("<- {}", text.as_str());
                        match codec::decode(text.as_str()) {
                            Ok(Packet::Ping) => {
                                deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                                if let Err(error) = send_packet(&mut sink, &Packet::Pong).await {
                                    return SessionEnd::Dropped { error, unsent: Vec::new() };
                                }
                            }
                            Ok(Packet::Message(SocketPacket::Event { name, args })) => {
                                match ServerEvent::decode(&name, args) {
                                    Ok(event) => shared.dispatch(&event),
                                    Err(e) => warn!("Dropping event: {e}"),
                                }
                            }
                            Ok(Packet::Message(SocketPacket::Disconnect)) => {
                                return SessionEnd::ServerDisconnect;
                            }
                            Ok(Packet::Close) => {
                                return SessionEnd::Dropped {
                                    error: ConnectionError::Transport("server closed transport".into()),
                                    unsent: Vec::new(),
                                };
                            }
                            Ok(_) => {} // pong, noop, late connect ack
                            Err(e) => warn!("Dropping malformed frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped {
                            error: ConnectionError::Transport("connection closed by server".into()),
                            unsent: Vec::new(),
                        };
                    }
                    Some(Ok(_)) => {} // binary, ws-level ping/pong
                    Some(Err(e)) => {
                        return SessionEnd::Dropped {
                            error: ConnectionError::Transport(e.to_string()),
                            unsent: Vec::new(),
                        };
                    }
                }
            }
        }
    }
}
