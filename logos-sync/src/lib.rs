//! # logos-sync — End-to-end encrypted real-time scene sync
//!
//! Peers edit a shared scene of elements. Every change is encrypted with a
//! per-room key, relayed through a server that only sees ciphertext, and
//! merged on arrival by deterministic last-writer-wins reconciliation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Frame (bincode)   ┌──────────────┐   Frame    ┌──────────────┐
//! │ Collab + UI  │ ◄─────────────────► │  SyncServer  │ ◄────────► │ Collab + UI  │
//! │   (peer A)   │  encrypted payloads │   (relay)    │            │   (peer B)   │
//! └──────┬───────┘                     └──────┬───────┘            └──────┬───────┘
//!        │ Portal ─ Transport                 │ RoomManager               │
//!        ▼                                    ▼                           ▼
//! ┌──────────────┐                     ┌──────────────┐            ┌──────────────┐
//! │  reconcile   │                     │  RocksStore  │ ◄───────── │ RemoteStore  │
//! │  + watermark │                     │  (optional)  │  Storage*  │              │
//! └──────────────┘                     └──────────────┘            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`] — elements, scenes, fractional ordering
//! - [`reconcile`] — merge of local and remote scenes
//! - [`version`] — scene version and broadcast watermark
//! - [`crypto`] / [`room`] — room keys, AES-GCM, shareable links
//! - [`protocol`] — relay frames and encrypted payload schema
//! - [`client`] / [`portal`] — transports and the per-room session
//! - [`collab`] — the coordinator driving one collaboration session
//! - [`storage`] / [`files`] — encrypted persistence of scenes and files
//! - [`presence`] — collaborators, pointers, idle detection
//! - [`broadcast`] / [`server`] — the relay

pub mod broadcast;
pub mod client;
pub mod collab;
pub mod config;
pub mod crypto;
pub mod element;
pub mod files;
pub mod fractional;
pub mod portal;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod room;
pub mod server;
pub mod storage;
pub mod throttle;
pub mod version;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, RoomManager};
pub use client::{
    ChannelConnector, ChannelPeer, Connector, RemoteStore, SocketEvent, Transport, WsConnector,
};
pub use collab::{
    Collab, CollabCommand, CollabError, CollabSignal, CollabState, JoinTarget, PointerUpdate,
    RoomSummary, UnloadVerdict,
};
pub use config::SyncConfig;
pub use crypto::{CryptoError, RoomKey};
pub use element::{Element, ElementId, FileId, FileStatus, Scene, SceneError};
pub use files::{BinaryFile, FileManager};
pub use portal::{Portal, PortalError, PortalState};
pub use presence::{Collaborator, IdleDetector, Pointer, PointerButton, UserIdleState};
pub use protocol::{Frame, ProtocolError, SceneBounds, SocketId, SocketPayload, UserToFollow};
pub use reconcile::reconcile;
pub use room::{RoomId, RoomLinkData};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    MemoryStore, Namespace, RocksStore, SceneStore, StorageBackend, StoreConfig, StoreError,
};
pub use version::{scene_version, Watermark};
