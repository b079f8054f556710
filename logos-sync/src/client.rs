//! Client side of the relay connection.
//!
//! Provides:
//! - [`Transport`] / [`Connector`]: what the portal needs from a socket
//! - [`WsConnector`]: WebSocket transport to a [`crate::server::SyncServer`]
//! - [`ChannelConnector`]: in-process transport driven by a [`ChannelPeer`]
//! - [`RemoteStore`]: [`StorageBackend`] served by the relay
//!
//! Socket events are delivered on an unbounded channel so the coordinator
//! can consume them in arrival order from its own loop.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{Frame, ProtocolError, SocketId};
use crate::room::RoomId;
use crate::storage::{Namespace, StorageBackend, StoreError};

/// Connection state as seen by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Connection established, relay assigned our socket id
    Connected(SocketId),
    /// Could not connect
    ConnectError(String),
    /// Connection lost
    Disconnected,
    InitRoom,
    FirstInRoom,
    NewUser(SocketId),
    RoomUserChange(Vec<SocketId>),
    ClientBroadcast { iv: Vec<u8>, ciphertext: Vec<u8> },
    UserFollowRoomChange(Vec<SocketId>),
}

impl SocketEvent {
    /// Map a relay frame to an event. Frames that are replies to requests
    /// map to `None`.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Connected { socket_id } => Some(SocketEvent::Connected(socket_id)),
            Frame::InitRoom => Some(SocketEvent::InitRoom),
            Frame::FirstInRoom => Some(SocketEvent::FirstInRoom),
            Frame::NewUser { socket_id } => Some(SocketEvent::NewUser(socket_id)),
            Frame::RoomUserChange { socket_ids } => Some(SocketEvent::RoomUserChange(socket_ids)),
            Frame::ClientBroadcast { iv, ciphertext } => {
                Some(SocketEvent::ClientBroadcast { iv, ciphertext })
            }
            Frame::UserFollowRoomChange { followed_by } => {
                Some(SocketEvent::UserFollowRoomChange(followed_by))
            }
            _ => None,
        }
    }
}

/// An open socket to the relay.
pub trait Transport: Send {
    /// Queue a frame for sending. Never blocks.
    fn emit(&self, frame: Frame) -> Result<(), ProtocolError>;

    fn close(&mut self);
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// Start connecting. Progress and incoming frames arrive on `events`.
    fn open(&self, events: mpsc::UnboundedSender<SocketEvent>) -> Result<Self::Transport, ProtocolError>;

    /// Rooms with live connections and their member counts.
    fn active_rooms(&self) -> impl Future<Output = Result<Vec<(RoomId, usize)>, ProtocolError>> + Send;
}

// ─── WebSocket ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    request_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    fn open(&self, events: mpsc::UnboundedSender<SocketEvent>) -> Result<WsTransport, ProtocolError> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(self.url.clone(), outgoing_rx, events));
        Ok(WsTransport { outgoing, task })
    }

    async fn active_rooms(&self) -> Result<Vec<(RoomId, usize)>, ProtocolError> {
        let mut conn = RequestConnection::connect(&self.url, self.request_timeout).await?;
        match conn.request(Frame::ListRooms).await? {
            Frame::RoomList { rooms } => Ok(rooms),
            other => Err(ProtocolError::UnexpectedFrame(other.event_name())),
        }
    }
}

pub struct WsTransport {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl Transport for WsTransport {
    fn emit(&self, frame: Frame) -> Result<(), ProtocolError> {
        let bytes = frame.encode()?;
        self.outgoing
            .send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&mut self) {
        self.task.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_socket(
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::warn!("Failed to connect to {url}: {e}");
            let _ = events.send(SocketEvent::ConnectError(e.to_string()));
            return;
        }
    };
    log::debug!("Connected to {url}");
    let (mut writer, mut reader) = ws.split();

    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(bytes) => {
                    if writer.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match Frame::decode(&data) {
                    Ok(frame) => {
                        log::trace!("Received {}", frame.event_name());
                        if let Some(event) = SocketEvent::from_frame(frame) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => log::warn!("Dropping malformed frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    log::info!("Disconnected from {url}");
    let _ = events.send(SocketEvent::Disconnected);
}

/// Dedicated request/response connection to the relay.
struct RequestConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    timeout: Duration,
}

impl RequestConnection {
    async fn connect(url: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        Ok(Self { stream, timeout })
    }

    /// Send `frame` and wait for the first reply, skipping room events.
    async fn request(&mut self, frame: Frame) -> Result<Frame, ProtocolError> {
        self.stream
            .send(Message::Binary(frame.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        tokio::time::timeout(self.timeout, async {
            while let Some(msg) = self.stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let reply = Frame::decode(&data)?;
                        if SocketEvent::from_frame(reply.clone()).is_none() {
                            return Ok(reply);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            Err(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)?
    }
}

// ─── Relay-hosted storage ───────────────────────────────────────────────────

/// Storage backend served by the relay over its own WebSocket.
///
/// Requests are serialized over one lazily opened connection; a failed
/// request drops the connection so the next one reconnects.
pub struct RemoteStore {
    url: String,
    timeout: Duration,
    conn: Mutex<Option<RequestConnection>>,
}

impl RemoteStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            conn: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, frame: Frame) -> Result<Frame, StoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let conn = RequestConnection::connect(&self.url, self.timeout)
                .await
                .map_err(|e| StoreError::Remote(e.to_string()))?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Remote("no connection".into()));
        };
        match conn.request(frame).await {
            Ok(Frame::StorageFailed { message }) => Err(StoreError::Remote(message)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                *guard = None;
                Err(StoreError::Remote(e.to_string()))
            }
        }
    }
}

fn unexpected(frame: &Frame) -> StoreError {
    StoreError::Remote(format!("unexpected reply {}", frame.event_name()))
}

impl StorageBackend for RemoteStore {
    async fn get(&self, key: &str, namespace: Namespace) -> Result<Option<Vec<u8>>, StoreError> {
        match self
            .request(Frame::StorageGet { namespace, key: key.to_string() })
            .await?
        {
            Frame::StorageValue { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, namespace: Namespace) -> Result<(), StoreError> {
        match self
            .request(Frame::StorageSet { namespace, key: key.to_string(), value })
            .await?
        {
            Frame::StorageAck => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn has(&self, key: &str, namespace: Namespace) -> Result<bool, StoreError> {
        match self
            .request(Frame::StorageHas { namespace, key: key.to_string() })
            .await?
        {
            Frame::StorageFlag { present } => Ok(present),
            other => Err(unexpected(&other)),
        }
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        match self.request(Frame::StorageKeys { namespace }).await? {
            Frame::StorageKeyList { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }
}

// ─── In-process channel ─────────────────────────────────────────────────────

struct ChannelShared {
    frames: mpsc::UnboundedSender<Frame>,
    events: Option<mpsc::UnboundedSender<SocketEvent>>,
    active_rooms: Vec<(RoomId, usize)>,
    refuse: bool,
}

/// Transport over in-process channels. The matching [`ChannelPeer`] plays
/// the relay: it sees every emitted frame and injects socket events.
#[derive(Clone)]
pub struct ChannelConnector {
    shared: Arc<StdMutex<ChannelShared>>,
}

pub struct ChannelPeer {
    frames: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<StdMutex<ChannelShared>>,
}

pub struct ChannelTransport {
    frames: Option<mpsc::UnboundedSender<Frame>>,
}

impl ChannelConnector {
    pub fn new() -> (Self, ChannelPeer) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StdMutex::new(ChannelShared {
            frames,
            events: None,
            active_rooms: Vec::new(),
            refuse: false,
        }));
        (
            Self { shared: shared.clone() },
            ChannelPeer { frames: frames_rx, shared },
        )
    }
}

fn lock(shared: &StdMutex<ChannelShared>) -> std::sync::MutexGuard<'_, ChannelShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    fn open(&self, events: mpsc::UnboundedSender<SocketEvent>) -> Result<ChannelTransport, ProtocolError> {
        let mut shared = lock(&self.shared);
        if shared.refuse {
            return Err(ProtocolError::ConnectionFailed("connection refused".into()));
        }
        shared.events = Some(events);
        Ok(ChannelTransport {
            frames: Some(shared.frames.clone()),
        })
    }

    async fn active_rooms(&self) -> Result<Vec<(RoomId, usize)>, ProtocolError> {
        Ok(lock(&self.shared).active_rooms.clone())
    }
}

impl Transport for ChannelTransport {
    fn emit(&self, frame: Frame) -> Result<(), ProtocolError> {
        let frames = self.frames.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        frames.send(frame).map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&mut self) {
        self.frames = None;
    }
}

impl ChannelPeer {
    /// Deliver an event to the most recently opened transport.
    pub fn send(&self, event: SocketEvent) -> bool {
        lock(&self.shared)
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Frames emitted so far, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn set_active_rooms(&self, rooms: Vec<(RoomId, usize)>) {
        lock(&self.shared).active_rooms = rooms;
    }

    /// Make subsequent `open` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.shared).refuse = refuse;
    }
}
