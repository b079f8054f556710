//! The portal: one room session over one transport.
//!
//! ```text
//!  open()          Connected          mark_initialized()
//! ───────► Connecting ───────► Connected ─────────────────► Initialized
//!              ▲                   │ (uninitialized)              │
//!              └── ConnectError ───┘                              │
//!  Disconnected ◄───────────────────── close() ───────────────────┘
//! ```
//!
//! The portal keeps connection bookkeeping, seals outbound payloads and
//! opens inbound ones. It does not decide anything about the scene; the
//! coordinator does.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::{ConnectionState, SocketEvent, Transport};
use crate::crypto::{self, CryptoError};
use crate::element::{now_millis, ElementId, Scene};
use crate::presence::{Pointer, PointerButton, UserIdleState};
use crate::protocol::{
    FollowRequest, Frame, IdleStatus, MouseLocation, ProtocolError, SceneBounds, SocketId,
    SocketPayload, VisibleSceneBounds,
};
use crate::room::{follow_room_id, RoomId, RoomLinkData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Disconnected,
    Connecting,
    /// Connected, scene not bootstrapped yet.
    Connected,
    Initialized,
}

/// Kind of scene broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneBroadcast {
    Init,
    Update,
}

pub struct Portal<T> {
    transport: Option<T>,
    events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    room: Option<RoomLinkData>,
    socket_id: Option<SocketId>,
    connection: ConnectionState,
    initialized: bool,
    /// Last broadcast version per element, for incremental updates.
    broadcasted_versions: HashMap<ElementId, u64>,
    tombstone_ttl: Duration,
}

impl<T: Transport> Portal<T> {
    pub fn new(tombstone_ttl: Duration) -> Self {
        Self {
            transport: None,
            events: None,
            room: None,
            socket_id: None,
            connection: ConnectionState::Disconnected,
            initialized: false,
            broadcasted_versions: HashMap::new(),
            tombstone_ttl,
        }
    }

    pub fn open(&mut self, transport: T, events: mpsc::UnboundedReceiver<SocketEvent>, room: RoomLinkData) {
        log::info!("Opening portal to room {}", room.room_id);
        self.transport = Some(transport);
        self.events = Some(events);
        self.room = Some(room);
        self.connection = ConnectionState::Connecting;
    }

    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(room) = self.room.take() {
            log::info!("Closed portal to room {}", room.room_id);
        }
        self.events = None;
        self.socket_id = None;
        self.connection = ConnectionState::Disconnected;
        self.initialized = false;
        self.broadcasted_versions.clear();
    }

    pub fn state(&self) -> PortalState {
        if self.transport.is_none() {
            PortalState::Disconnected
        } else if self.initialized {
            PortalState::Initialized
        } else if self.connection == ConnectionState::Connected {
            PortalState::Connected
        } else {
            PortalState::Connecting
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Connected and bound to a room.
    pub fn is_open(&self) -> bool {
        self.transport.is_some() && self.connection == ConnectionState::Connected && self.room.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn room(&self) -> Option<&RoomLinkData> {
        self.room.as_ref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|r| &r.room_id)
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    /// Next socket event. Pends forever while closed.
    pub async fn next_event(&mut self) -> SocketEvent {
        if let Some(events) = self.events.as_mut() {
            if let Some(event) = events.recv().await {
                return event;
            }
            self.events = None;
        }
        std::future::pending().await
    }

    /// Connection bookkeeping for an incoming event. Everything with scene
    /// or presence semantics is left to the coordinator.
    pub fn handle_transport_event(&mut self, event: &SocketEvent) {
        match event {
            SocketEvent::Connected(socket_id) => {
                log::debug!("Socket connected as {socket_id}");
                self.socket_id = Some(socket_id.clone());
                self.connection = ConnectionState::Connected;
            }
            SocketEvent::ConnectError(_) | SocketEvent::Disconnected => {
                self.connection = ConnectionState::Disconnected;
            }
            SocketEvent::InitRoom => {
                self.connection = ConnectionState::Connected;
                if let Some(room_id) = self.room_id().cloned() {
                    if let Err(e) = self.emit(Frame::JoinRoom { room_id }) {
                        log::warn!("Failed to join room: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    /// Decrypt and parse a `client-broadcast` body.
    pub fn decode(&self, iv: &[u8], ciphertext: &[u8]) -> Result<SocketPayload, PortalError> {
        let room = self.room.as_ref().ok_or(PortalError::NotOpen)?;
        let plaintext = crypto::decrypt(&room.room_key, iv, ciphertext)?;
        Ok(SocketPayload::from_json(&plaintext)?)
    }

    // ─── Outbound ─────────────────────────────────────────────────

    /// Broadcast syncable elements. With `sync_all = false` only elements
    /// new or changed since their last broadcast are sent. Returns the
    /// number of elements sent.
    pub fn broadcast_scene(&mut self, kind: SceneBroadcast, scene: &Scene, sync_all: bool) -> Result<usize, PortalError> {
        if !self.is_open() {
            return Err(PortalError::NotOpen);
        }
        let now = now_millis();
        let elements: Vec<_> = scene
            .iter()
            .filter(|e| {
                sync_all
                    || self
                        .broadcasted_versions
                        .get(&e.id)
                        .map_or(true, |&v| e.version > v)
            })
            .filter(|e| e.is_syncable(now, self.tombstone_ttl))
            .cloned()
            .collect();
        if elements.is_empty() && !sync_all && kind == SceneBroadcast::Update {
            return Ok(0);
        }

        let sent = elements.len();
        let versions: Vec<(ElementId, u64)> = elements
            .iter()
            .map(|e| (e.id.clone(), e.version))
            .collect();
        let elements = Scene::from_sorted(elements);
        let payload = match kind {
            SceneBroadcast::Init => SocketPayload::SceneInit { elements },
            SceneBroadcast::Update => SocketPayload::SceneUpdate { elements },
        };
        // Only what actually left counts as broadcast
        self.broadcast_socket_data(&payload, None)?;
        self.broadcasted_versions.extend(versions);
        log::debug!("Broadcast {kind:?} with {sent} elements");
        Ok(sent)
    }

    pub fn broadcast_mouse_location(
        &self,
        pointer: Pointer,
        button: PointerButton,
        selected_element_ids: Vec<ElementId>,
        username: &str,
    ) -> Result<(), PortalError> {
        let socket_id = self.require_socket()?;
        self.broadcast_socket_data(
            &SocketPayload::MouseLocation(MouseLocation {
                socket_id,
                pointer,
                button,
                selected_element_ids,
                username: username.to_string(),
            }),
            None,
        )
    }

    pub fn broadcast_idle_change(&self, user_state: UserIdleState, username: &str) -> Result<(), PortalError> {
        let socket_id = self.require_socket()?;
        self.broadcast_socket_data(
            &SocketPayload::IdleStatus(IdleStatus {
                socket_id,
                user_state,
                username: username.to_string(),
            }),
            None,
        )
    }

    /// Send our viewport to everyone following us.
    pub fn broadcast_visible_scene_bounds(&self, scene_bounds: SceneBounds, username: &str) -> Result<(), PortalError> {
        let socket_id = self.require_socket()?;
        let room_id = follow_room_id(&socket_id);
        self.broadcast_socket_data(
            &SocketPayload::VisibleSceneBounds(VisibleSceneBounds {
                socket_id,
                username: username.to_string(),
                scene_bounds,
            }),
            Some(room_id),
        )
    }

    pub fn broadcast_user_followed(&self, request: FollowRequest) -> Result<(), PortalError> {
        if !self.is_open() {
            return Err(PortalError::NotOpen);
        }
        self.emit(Frame::UserFollow(request))
    }

    fn broadcast_socket_data(&self, payload: &SocketPayload, room_id: Option<RoomId>) -> Result<(), PortalError> {
        if !self.is_open() {
            return Err(PortalError::NotOpen);
        }
        let room = self.room.as_ref().ok_or(PortalError::NotOpen)?;
        let sealed = crypto::encrypt(&room.room_key, &payload.to_json()?)?;
        let room_id = room_id.unwrap_or_else(|| room.room_id.clone());
        let iv = sealed.iv.to_vec();
        let ciphertext = sealed.ciphertext;
        let frame = if payload.is_volatile() {
            Frame::ServerVolatileBroadcast { room_id, iv, ciphertext }
        } else {
            Frame::ServerBroadcast { room_id, iv, ciphertext }
        };
        self.emit(frame)
    }

    fn emit(&self, frame: Frame) -> Result<(), PortalError> {
        let transport = self.transport.as_ref().ok_or(PortalError::NotOpen)?;
        log::trace!("Emitting {}", frame.event_name());
        transport.emit(frame)?;
        Ok(())
    }

    fn require_socket(&self) -> Result<SocketId, PortalError> {
        if !self.is_open() {
            return Err(PortalError::NotOpen);
        }
        self.socket_id.clone().ok_or(PortalError::NotOpen)
    }
}

/// Portal errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PortalError {
    /// No connected socket or no room.
    NotOpen,
    Crypto(CryptoError),
    Protocol(ProtocolError),
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalError::NotOpen => write!(f, "Portal is not open"),
            PortalError::Crypto(e) => write!(f, "{e}"),
            PortalError::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<CryptoError> for PortalError {
    fn from(e: CryptoError) -> Self {
        PortalError::Crypto(e)
    }
}

impl From<ProtocolError> for PortalError {
    fn from(e: ProtocolError) -> Self {
        PortalError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChannelConnector, ChannelTransport, Connector};
    use crate::element::Element;

    const TTL: Duration = Duration::from_secs(24 * 60 * 60);

    fn open_portal() -> (Portal<ChannelTransport>, crate::client::ChannelPeer, RoomLinkData) {
        let (connector, peer) = ChannelConnector::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = connector.open(events_tx).unwrap();
        let room = RoomLinkData::generate();
        let mut portal = Portal::new(TTL);
        portal.open(transport, events_rx, room.clone());
        (portal, peer, room)
    }

    fn scene(ids: &[&str]) -> Scene {
        Scene::from_ordered(ids.iter().map(|id| Element::new(*id)).collect()).unwrap()
    }

    fn sealed_payload(frame: &Frame, portal: &Portal<ChannelTransport>) -> SocketPayload {
        match frame {
            Frame::ServerBroadcast { iv, ciphertext, .. }
            | Frame::ServerVolatileBroadcast { iv, ciphertext, .. } => portal.decode(iv, ciphertext).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (mut portal, _peer, _room) = open_portal();
        assert_eq!(portal.state(), PortalState::Connecting);
        portal.handle_transport_event(&SocketEvent::Connected("me".into()));
        assert_eq!(portal.state(), PortalState::Connected);
        assert!(portal.is_open());
        portal.mark_initialized();
        assert_eq!(portal.state(), PortalState::Initialized);
        portal.close();
        assert_eq!(portal.state(), PortalState::Disconnected);
        assert!(!portal.is_initialized());
    }

    #[tokio::test]
    async fn test_init_room_joins() {
        let (mut portal, mut peer, room) = open_portal();
        portal.handle_transport_event(&SocketEvent::InitRoom);
        assert_eq!(peer.drain(), vec![Frame::JoinRoom { room_id: room.room_id }]);
    }

    #[tokio::test]
    async fn test_broadcast_requires_connection() {
        let (mut portal, _peer, _room) = open_portal();
        let err = portal.broadcast_scene(SceneBroadcast::Update, &scene(&["a"]), false);
        assert_eq!(err, Err(PortalError::NotOpen));
    }

    #[tokio::test]
    async fn test_incremental_broadcast() {
        let (mut portal, mut peer, _room) = open_portal();
        portal.handle_transport_event(&SocketEvent::Connected("me".into()));

        let mut s = scene(&["a", "b"]);
        assert_eq!(portal.broadcast_scene(SceneBroadcast::Update, &s, false), Ok(2));
        assert_eq!(portal.broadcast_scene(SceneBroadcast::Update, &s, false), Ok(0));

        s.mutate("b", |_| {});
        assert_eq!(portal.broadcast_scene(SceneBroadcast::Update, &s, false), Ok(1));

        let frames = peer.drain();
        assert_eq!(frames.len(), 2);
        match sealed_payload(&frames[1], &portal) {
            SocketPayload::SceneUpdate { elements } => {
                assert_eq!(elements.len(), 1);
                assert!(elements.contains("b"));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        assert_eq!(portal.broadcast_scene(SceneBroadcast::Update, &s, true), Ok(2));
    }

    #[tokio::test]
    async fn test_failed_send_not_recorded() {
        let (mut portal, peer, _room) = open_portal();
        portal.handle_transport_event(&SocketEvent::Connected("me".into()));
        drop(peer);

        let s = scene(&["a", "b"]);
        assert_eq!(
            portal.broadcast_scene(SceneBroadcast::Update, &s, false),
            Err(PortalError::Protocol(ProtocolError::ConnectionClosed))
        );
        assert!(portal.broadcasted_versions.is_empty());
    }

    #[tokio::test]
    async fn test_presence_is_volatile() {
        let (mut portal, mut peer, _room) = open_portal();
        portal.handle_transport_event(&SocketEvent::Connected("me".into()));
        portal
            .broadcast_idle_change(UserIdleState::Idle, "Ann")
            .unwrap();
        let frames = peer.drain();
        assert!(matches!(frames[0], Frame::ServerVolatileBroadcast { .. }));
        match sealed_payload(&frames[0], &portal) {
            SocketPayload::IdleStatus(status) => {
                assert_eq!(status.socket_id, "me");
                assert_eq!(status.user_state, UserIdleState::Idle);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bounds_go_to_follow_room() {
        let (mut portal, mut peer, _room) = open_portal();
        portal.handle_transport_event(&SocketEvent::Connected("me".into()));
        portal
            .broadcast_visible_scene_bounds(SceneBounds([0.0, 0.0, 10.0, 10.0]), "Ann")
            .unwrap();
        match &peer.drain()[0] {
            Frame::ServerVolatileBroadcast { room_id, .. } => assert_eq!(room_id, "follow@me"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_with_wrong_key_fails() {
        let (portal, _peer, _room) = open_portal();
        let other = crypto::RoomKey::generate();
        let json = SocketPayload::SceneUpdate { elements: Scene::new() }.to_json().unwrap();
        let sealed = crypto::encrypt(&other, &json).unwrap();
        assert!(matches!(
            portal.decode(&sealed.iv, &sealed.ciphertext),
            Err(PortalError::Crypto(CryptoError::DecryptionFailed))
        ));
    }
}
