//! Wire protocol between clients and the relay, and the encrypted
//! application payloads riding inside it.
//!
//! Two layers:
//! ```text
//! ┌──────────────────────────── Frame (bincode) ───────────────────────────┐
//! │ ServerBroadcast { room_id, iv, ciphertext }                            │
//! │                              └─ AES-GCM ─► SocketPayload (JSON)        │
//! │                                            { "type": "SCENE_UPDATE",   │
//! │                                              "payload": { ... } }      │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay only routes frames. It never sees a `SocketPayload` in the
//! clear.

use serde::{Deserialize, Serialize};

use crate::element::{ElementId, Scene};
use crate::presence::{Pointer, PointerButton, UserIdleState};
use crate::room::RoomId;
use crate::storage::Namespace;

/// Connection id assigned by the relay.
pub type SocketId = String;

// ─── Transport frames ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // client → relay
    JoinRoom { room_id: RoomId },
    ServerBroadcast { room_id: RoomId, iv: Vec<u8>, ciphertext: Vec<u8> },
    /// Droppable under backpressure (pointer, idle, viewport).
    ServerVolatileBroadcast { room_id: RoomId, iv: Vec<u8>, ciphertext: Vec<u8> },
    UserFollow(FollowRequest),
    ListRooms,
    StorageGet { namespace: Namespace, key: String },
    StorageSet { namespace: Namespace, key: String, value: Vec<u8> },
    StorageHas { namespace: Namespace, key: String },
    StorageKeys { namespace: Namespace },
    Ping,

    // relay → client
    Connected { socket_id: SocketId },
    InitRoom,
    FirstInRoom,
    NewUser { socket_id: SocketId },
    RoomUserChange { socket_ids: Vec<SocketId> },
    ClientBroadcast { iv: Vec<u8>, ciphertext: Vec<u8> },
    UserFollowRoomChange { followed_by: Vec<SocketId> },
    RoomList { rooms: Vec<(RoomId, usize)> },
    StorageValue { value: Option<Vec<u8>> },
    StorageFlag { present: bool },
    StorageKeyList { keys: Vec<String> },
    StorageAck,
    StorageFailed { message: String },
    Pong,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Event name as the relay logs it.
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::JoinRoom { .. } => "join-room",
            Frame::ServerBroadcast { .. } => "server-broadcast",
            Frame::ServerVolatileBroadcast { .. } => "server-volatile-broadcast",
            Frame::UserFollow(_) => "user-follow",
            Frame::ListRooms => "list-rooms",
            Frame::StorageGet { .. } => "storage-get",
            Frame::StorageSet { .. } => "storage-set",
            Frame::StorageHas { .. } => "storage-has",
            Frame::StorageKeys { .. } => "storage-keys",
            Frame::Ping => "ping",
            Frame::Connected { .. } => "connected",
            Frame::InitRoom => "init-room",
            Frame::FirstInRoom => "first-in-room",
            Frame::NewUser { .. } => "new-user",
            Frame::RoomUserChange { .. } => "room-user-change",
            Frame::ClientBroadcast { .. } => "client-broadcast",
            Frame::UserFollowRoomChange { .. } => "user-follow-room-change",
            Frame::RoomList { .. } => "room-list",
            Frame::StorageValue { .. } => "storage-value",
            Frame::StorageFlag { .. } => "storage-flag",
            Frame::StorageKeyList { .. } => "storage-key-list",
            Frame::StorageAck => "storage-ack",
            Frame::StorageFailed { .. } => "storage-failed",
            Frame::Pong => "pong",
        }
    }
}

// ─── Follow mode ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToFollow {
    pub socket_id: SocketId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FollowAction {
    Follow,
    Unfollow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRequest {
    pub user_to_follow: UserToFollow,
    pub action: FollowAction,
}

// ─── Application payloads ───────────────────────────────────────────────────

/// Visible scene rectangle `[x1, y1, x2, y2]` in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneBounds(pub [f64; 4]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseLocation {
    pub socket_id: SocketId,
    pub pointer: Pointer,
    pub button: PointerButton,
    #[serde(default)]
    pub selected_element_ids: Vec<ElementId>,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleStatus {
    pub socket_id: SocketId,
    pub user_state: UserIdleState,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleSceneBounds {
    pub socket_id: SocketId,
    pub username: String,
    pub scene_bounds: SceneBounds,
}

/// Decrypted body of a `client-broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SocketPayload {
    #[serde(rename = "SCENE_INIT")]
    SceneInit { elements: Scene },
    #[serde(rename = "SCENE_UPDATE")]
    SceneUpdate { elements: Scene },
    #[serde(rename = "MOUSE_LOCATION")]
    MouseLocation(MouseLocation),
    #[serde(rename = "IDLE_STATUS")]
    IdleStatus(IdleStatus),
    #[serde(rename = "USER_VISIBLE_SCENE_BOUNDS")]
    VisibleSceneBounds(VisibleSceneBounds),
}

impl SocketPayload {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Pointer, idle and viewport updates may be dropped by the relay.
    pub fn is_volatile(&self) -> bool {
        !matches!(self, SocketPayload::SceneInit { .. } | SocketPayload::SceneUpdate { .. })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedFrame(&'static str),
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(name) => write!(f, "Unexpected frame: {name}"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
