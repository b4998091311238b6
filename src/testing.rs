//! In-process Socket.IO server for transport tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::{self, Handshake, Packet, SocketPacket};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState};
use crate::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy)]
pub struct MockOptions {
    /// Answer the namespace connect with `44{"message":"denied"}`.
    pub reject: bool,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            reject: false,
            ping_interval: 25_000,
            ping_timeout: 20_000,
        }
    }
}

#[derive(Debug, Clone)]
enum Command {
    Frame(String),
    Kick,
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    live: AtomicUsize,
    pongs: AtomicUsize,
}

pub struct MockServer {
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<ClientEvent>,
    commands: broadcast::Sender<Command>,
    counters: Arc<Counters>,
    accepting: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_options(MockOptions::default()).await
    }

    pub async fn with_options(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, _) = broadcast::channel(64);
        let counters = Arc::new(Counters::default());
        let accepting = Arc::new(AtomicBool::new(true));

        let accept_task = {
            let commands = commands.clone();
            let counters = Arc::clone(&counters);
            let accepting = Arc::clone(&accepting);
            tokio::spawn(async move {
                let mut next_sid = 0u64;
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    if !accepting.load(Ordering::SeqCst) {
                        drop(stream);
                        continue;
                    }
                    next_sid += 1;
                    tokio::spawn(serve(
                        stream,
                        format!("sid-{next_sid}"),
                        options,
                        received_tx.clone(),
                        commands.subscribe(),
                        Arc::clone(&counters),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            commands,
            counters,
            accepting,
            accept_task,
        }
    }

    /// Client config aimed at this server with fast reconnects.
    pub fn client_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnection_delay_ms: 10,
            reconnection_delay_max_ms: 40,
            connect_timeout_ms: 2000,
            ..ConnectionConfig::with_url(format!("http://{}", self.addr))
        }
    }

    /// Namespace connects acknowledged so far.
    pub fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    pub fn pongs(&self) -> usize {
        self.counters.pongs.load(Ordering::SeqCst)
    }

    /// Refuse new sockets by closing them before the WebSocket handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Send an event to every connected client.
    pub fn push(&self, event: ServerEvent) {
        self.push_raw(&codec::encode(&Packet::Message(event.to_packet())));
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.commands.send(Command::Frame(frame.to_string()));
    }

    /// Close every connected client's socket.
    pub fn kick(&self) {
        let _ = self.commands.send(Command::Kick);
    }

    pub async fn next_event(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("mock server stopped")
    }

    pub async fn assert_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.received.recv()).await;
        assert!(next.is_err(), "unexpected client event: {next:?}");
    }

    /// Wait until no client socket is open.
    pub async fn wait_for_close(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.counters.live.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client socket still open");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.commands.send(Command::Kick);
    }
}

async fn serve(
    stream: TcpStream,
    sid: String,
    options: MockOptions,
    received: mpsc::UnboundedSender<ClientEvent>,
    mut commands: broadcast::Receiver<Command>,
    counters: Arc<Counters>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut reader) = ws.split();

    let open = Packet::Open(Handshake {
        sid: sid.clone(),
        upgrades: Vec::new(),
        ping_interval: options.ping_interval,
        ping_timeout: options.ping_timeout,
    });
    if sink.send(Message::Text(codec::encode(&open).into())).await.is_err() {
        return;
    }

    let mut connected = false;
    loop {
        tokio::select! {
            frame = reader.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                match codec::decode(text.as_str()) {
                    Ok(Packet::Message(SocketPacket::Connect(_))) => {
                        if options.reject {
                            let reply = Packet::Message(SocketPacket::ConnectError(json!({"message": "denied"})));
                            let _ = sink.send(Message::Text(codec::encode(&reply).into())).await;
                            let _ = sink.close().await;
                            break;
                        }
                        counters.connections.fetch_add(1, Ordering::SeqCst);
                        counters.live.fetch_add(1, Ordering::SeqCst);
                        connected = true;
                        let ack = Packet::Message(SocketPacket::Connect(Some(json!({"sid": sid}))));
                        if sink.send(Message::Text(codec::encode(&ack).into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Packet::Message(SocketPacket::Event { name, args })) => {
                        if let Ok(event) = ClientEvent::decode(&name, &args) {
                            let _ = received.send(event);
                        }
                    }
                    Ok(Packet::Message(SocketPacket::Disconnect)) => break,
                    Ok(Packet::Pong) => {
                        counters.pongs.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
            command = commands.recv() => {
                match command {
                    Ok(Command::Frame(frame)) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Command::Kick) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = sink.close().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }
    }

    if connected {
        counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait until the connection reaches a state matching `pred`.
pub async fn wait_for_state(
    connection: &Connection,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut rx = connection.watch_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&*state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("connection state channel closed");
        }
    })
    .await
    .expect("timed out waiting for connection state")
}
