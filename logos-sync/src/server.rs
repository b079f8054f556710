//! WebSocket relay: room routing for opaque encrypted payloads.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── outbox ──► Client B
//!            ├── RoomManager ───────┤
//! Client C ──┘   (room → sockets)   └── outbox ──► Client C
//!                     │
//!                     └── RocksStore (optional, Storage* frames)
//! ```
//!
//! The relay never decrypts anything. Per connection it:
//! - assigns a socket id and sends `connected` + `init-room`
//! - answers `join-room` with `first-in-room` or `new-user`, then
//!   `room-user-change` to everyone in the room
//! - forwards `server-broadcast` to the other members as `client-broadcast`
//! - maintains `follow@<socket>` rooms for follow mode
//! - serves key-value storage requests when a store is configured
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::protocol::{FollowAction, FollowRequest, Frame};
use crate::room::{follow_room_id, followed_socket};
use crate::storage::{RocksStore, StorageBackend, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per socket before it counts as lagging
    pub outbox_capacity: usize,
    /// Storage path for the relay-hosted store (None = no storage)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small outboxes.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbox_capacity: 64,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_broadcasts: u64,
    pub storage_requests: u64,
}

/// State shared by all connection tasks.
#[derive(Clone)]
struct RelayContext {
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<RocksStore>>,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: RelayContext,
}

impl SyncServer {
    /// Create a relay, opening its store if a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(RocksStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with an already opened store.
    pub fn with_store(config: ServerConfig, store: Option<Arc<RocksStore>>) -> Self {
        Self {
            ctx: RelayContext {
                rooms: Arc::new(RoomManager::new(config.outbox_capacity)),
                stats: Arc::new(RwLock::new(ServerStats::default())),
                store,
            },
            config,
        }
    }

    /// Default configuration, no storage.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: RelayContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let socket_id = Uuid::new_v4().simple().to_string();
        let mut outbox = ctx.rooms.register(&socket_id).await;
        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Socket {socket_id} connected from {addr}");

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            for frame in [
                Frame::Connected {
                    socket_id: socket_id.clone(),
                },
                Frame::InitRoom,
            ] {
                ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
            }

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match Frame::decode(&data) {
                                Ok(frame) => {
                                    if let Some(reply) = Self::handle_frame(&socket_id, frame, &ctx).await {
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                    out = outbox.recv() => match out {
                        Some(bytes) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        None => {
                            log::warn!("Socket {socket_id} evicted, closing");
                            let _ = ws_sender.close().await;
                            break;
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        Self::disconnect(&socket_id, &ctx).await;
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Route one client frame. Returns a direct reply, if any.
    async fn handle_frame(socket_id: &str, frame: Frame, ctx: &RelayContext) -> Option<Frame> {
        log::trace!("{} from {socket_id}", frame.event_name());
        match frame {
            Frame::JoinRoom { room_id } => {
                Self::join_room(socket_id, &room_id, ctx).await;
                None
            }
            Frame::ServerBroadcast {
                room_id,
                iv,
                ciphertext,
            } => {
                Self::relay(socket_id, &room_id, iv, ciphertext, false, ctx).await;
                None
            }
            Frame::ServerVolatileBroadcast {
                room_id,
                iv,
                ciphertext,
            } => {
                Self::relay(socket_id, &room_id, iv, ciphertext, true, ctx).await;
                None
            }
            Frame::UserFollow(request) => {
                Self::user_follow(socket_id, request, ctx).await;
                None
            }
            Frame::ListRooms => Some(Frame::RoomList {
                rooms: ctx.rooms.room_sizes().await,
            }),
            frame @ (Frame::StorageGet { .. }
            | Frame::StorageSet { .. }
            | Frame::StorageHas { .. }
            | Frame::StorageKeys { .. }) => {
                ctx.stats.write().await.storage_requests += 1;
                Some(Self::handle_storage(ctx.store.as_deref(), frame).await)
            }
            Frame::Ping => Some(Frame::Pong),
            other => {
                log::debug!("Ignoring {} from client {socket_id}", other.event_name());
                None
            }
        }
    }

    async fn join_room(socket_id: &str, room_id: &str, ctx: &RelayContext) {
        let outcome = ctx.rooms.join(room_id, socket_id).await;
        log::info!(
            "Socket {socket_id} joined room {room_id} ({} members)",
            outcome.members.len()
        );

        let announced = if outcome.first {
            ctx.rooms.send_to(socket_id, &Frame::FirstInRoom).await.map(|_| ())
        } else {
            let new_user = Frame::NewUser {
                socket_id: socket_id.to_string(),
            };
            ctx.rooms
                .broadcast(room_id, Some(socket_id), &new_user, false)
                .await
                .map(|_| ())
        };
        let change = Frame::RoomUserChange {
            socket_ids: outcome.members,
        };
        let changed = ctx.rooms.broadcast(room_id, None, &change, false).await;
        if let Err(e) = announced.and(changed.map(|_| ())) {
            log::error!("Failed to announce join of {socket_id} to {room_id}: {e}");
        }
    }

    async fn relay(socket_id: &str, room_id: &str, iv: Vec<u8>, ciphertext: Vec<u8>, volatile: bool, ctx: &RelayContext) {
        let frame = Frame::ClientBroadcast { iv, ciphertext };
        match ctx.rooms.broadcast(room_id, Some(socket_id), &frame, volatile).await {
            Ok(count) => {
                log::trace!("Relayed broadcast from {socket_id} to {count} sockets in {room_id}");
                ctx.stats.write().await.relayed_broadcasts += 1;
            }
            Err(e) => log::error!("Failed to relay broadcast in {room_id}: {e}"),
        }
    }

    async fn user_follow(socket_id: &str, request: FollowRequest, ctx: &RelayContext) {
        let followed = request.user_to_follow.socket_id;
        let room_id = follow_room_id(&followed);
        let followed_by = match request.action {
            FollowAction::Follow => ctx.rooms.join(&room_id, socket_id).await.members,
            FollowAction::Unfollow => {
                ctx.rooms.leave(&room_id, socket_id).await;
                ctx.rooms.members(&room_id).await
            }
        };
        log::debug!(
            "{socket_id} {:?} {followed}, {} followers",
            request.action,
            followed_by.len()
        );
        Self::notify_followed(&followed, followed_by, ctx).await;
    }

    async fn notify_followed(followed: &str, followed_by: Vec<String>, ctx: &RelayContext) {
        let frame = Frame::UserFollowRoomChange { followed_by };
        if let Err(e) = ctx.rooms.send_to(followed, &frame).await {
            log::error!("Failed to notify {followed} of follower change: {e}");
        }
    }

    /// Leave every room and tell whoever is left.
    async fn disconnect(socket_id: &str, ctx: &RelayContext) {
        for (room_id, remaining) in ctx.rooms.unregister(socket_id).await {
            if let Some(followed) = followed_socket(&room_id) {
                Self::notify_followed(followed, remaining, ctx).await;
            } else if !remaining.is_empty() {
                let change = Frame::RoomUserChange {
                    socket_ids: remaining,
                };
                if let Err(e) = ctx.rooms.broadcast(&room_id, None, &change, false).await {
                    log::error!("Failed to announce departure from {room_id}: {e}");
                }
            }
        }
        log::info!("Socket {socket_id} disconnected");
    }

    async fn handle_storage(store: Option<&RocksStore>, frame: Frame) -> Frame {
        let Some(store) = store else {
            return Frame::StorageFailed {
                message: "storage is not configured on this relay".into(),
            };
        };
        let result = match frame {
            Frame::StorageGet { namespace, key } => store
                .get(&key, namespace)
                .await
                .map(|value| Frame::StorageValue { value }),
            Frame::StorageSet {
                namespace,
                key,
                value,
            } => store
                .set(&key, value, namespace)
                .await
                .map(|()| Frame::StorageAck),
            Frame::StorageHas { namespace, key } => store
                .has(&key, namespace)
                .await
                .map(|present| Frame::StorageFlag { present }),
            Frame::StorageKeys { namespace } => store
                .keys(namespace)
                .await
                .map(|keys| Frame::StorageKeyList { keys }),
            other => {
                return Frame::StorageFailed {
                    message: format!("not a storage request: {}", other.event_name()),
                }
            }
        };
        result.unwrap_or_else(|e| {
            log::error!("Storage request failed: {e}");
            Frame::StorageFailed {
                message: e.to_string(),
            }
        })
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }

    /// Get the relay-hosted store (if configured).
    pub fn store(&self) -> Option<&Arc<RocksStore>> {
        self.ctx.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserToFollow;
    use crate::storage::Namespace;

    fn ctx(store: Option<Arc<RocksStore>>) -> RelayContext {
        SyncServer::with_store(ServerConfig::for_testing(), store).ctx
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbox_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_without_storage() {
        let server = SyncServer::new(ServerConfig::for_testing()).unwrap();
        assert!(server.store().is_none());
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_join_announces_first_and_new_user() {
        let ctx = ctx(None);
        let mut a = ctx.rooms.register("a").await;
        let mut b = ctx.rooms.register("b").await;

        SyncServer::join_room("a", "room", &ctx).await;
        let first = Frame::decode(&a.recv().await.unwrap()).unwrap();
        assert_eq!(first, Frame::FirstInRoom);
        let change = Frame::decode(&a.recv().await.unwrap()).unwrap();
        assert_eq!(change, Frame::RoomUserChange { socket_ids: vec!["a".into()] });

        SyncServer::join_room("b", "room", &ctx).await;
        let new_user = Frame::decode(&a.recv().await.unwrap()).unwrap();
        assert_eq!(new_user, Frame::NewUser { socket_id: "b".into() });
        let members = vec!["a".to_string(), "b".to_string()];
        for outbox in [&mut a, &mut b] {
            let change = Frame::decode(&outbox.recv().await.unwrap()).unwrap();
            assert_eq!(change, Frame::RoomUserChange { socket_ids: members.clone() });
        }
    }

    #[tokio::test]
    async fn test_relay_excludes_sender() {
        let ctx = ctx(None);
        let mut a = ctx.rooms.register("a").await;
        let mut b = ctx.rooms.register("b").await;
        ctx.rooms.join("room", "a").await;
        ctx.rooms.join("room", "b").await;

        SyncServer::relay("a", "room", vec![1; 12], vec![9, 9], false, &ctx).await;
        let frame = Frame::decode(&b.recv().await.unwrap()).unwrap();
        assert_eq!(frame, Frame::ClientBroadcast { iv: vec![1; 12], ciphertext: vec![9, 9] });
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_follow_and_disconnect_notify_followed() {
        let ctx = ctx(None);
        let mut leader = ctx.rooms.register("leader").await;
        let _fan = ctx.rooms.register("fan").await;

        let request = FollowRequest {
            user_to_follow: UserToFollow { socket_id: "leader".into(), username: "L".into() },
            action: FollowAction::Follow,
        };
        SyncServer::user_follow("fan", request, &ctx).await;
        let frame = Frame::decode(&leader.recv().await.unwrap()).unwrap();
        assert_eq!(frame, Frame::UserFollowRoomChange { followed_by: vec!["fan".into()] });

        SyncServer::disconnect("fan", &ctx).await;
        let frame = Frame::decode(&leader.recv().await.unwrap()).unwrap();
        assert_eq!(frame, Frame::UserFollowRoomChange { followed_by: vec![] });
    }

    #[tokio::test]
    async fn test_list_rooms_and_ping() {
        let ctx = ctx(None);
        let _a = ctx.rooms.register("a").await;
        ctx.rooms.join("room", "a").await;
        ctx.rooms.join("follow@x", "a").await;

        let reply = SyncServer::handle_frame("a", Frame::ListRooms, &ctx).await;
        assert_eq!(reply, Some(Frame::RoomList { rooms: vec![("room".into(), 1)] }));
        let reply = SyncServer::handle_frame("a", Frame::Ping, &ctx).await;
        assert_eq!(reply, Some(Frame::Pong));
    }

    #[tokio::test]
    async fn test_storage_without_store_fails() {
        let reply = SyncServer::handle_storage(None, Frame::StorageKeys { namespace: Namespace::Rooms }).await;
        assert!(matches!(reply, Frame::StorageFailed { .. }));
    }

    #[tokio::test]
    async fn test_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let ctx = ctx(Some(Arc::new(store)));

        let set = Frame::StorageSet {
            namespace: Namespace::Scenes,
            key: "room".into(),
            value: vec![1, 2, 3],
        };
        assert_eq!(SyncServer::handle_frame("a", set, &ctx).await, Some(Frame::StorageAck));

        let get = Frame::StorageGet { namespace: Namespace::Scenes, key: "room".into() };
        assert_eq!(
            SyncServer::handle_frame("a", get, &ctx).await,
            Some(Frame::StorageValue { value: Some(vec![1, 2, 3]) })
        );

        let has = Frame::StorageHas { namespace: Namespace::Files, key: "room".into() };
        assert_eq!(
            SyncServer::handle_frame("a", has, &ctx).await,
            Some(Frame::StorageFlag { present: false })
        );
    }
}
