//! The sync coordinator: one collaboration session, driven from one task.
//!
//! ```text
//!   commands (UI) ──┐
//!   socket events ──┼──► Collab::run ──► Portal ──► Transport ──► relay
//!   timer deadlines ┘        │
//!                            ├──► SceneStore / FileManager ──► StorageBackend
//!                            └──► CollabSignal ──► UI
//! ```
//!
//! Everything that mutates session state happens inside the loop, one event
//! at a time; the only suspension points are storage and transport calls.
//! Timers are deadlines owned by the coordinator (throttles, bootstrap
//! fallback, idle detector). Teardown clears them all, so nothing fires
//! into a finished session.
//!
//! ## Bootstrap race
//!
//! After opening a room, whichever comes first initializes the session:
//! a peer's `SCENE_INIT`, `first-in-room`, a connection error, or the
//! `initial_scene_timeout` fallback. The portal's initialized flag makes
//! the losers no-ops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::{Connector, SocketEvent};
use crate::config::SyncConfig;
use crate::crypto::RoomKey;
use crate::element::{now_millis, ElementId, FileId, FileStatus, Scene};
use crate::files::{BinaryFile, FileManager};
use crate::portal::{Portal, PortalError, PortalState, SceneBroadcast};
use crate::presence::{
    Collaborator, CollaboratorMap, CollaboratorPatch, IdleDetector, Pointer, PointerButton,
    UserIdleState,
};
use crate::protocol::{
    FollowAction, FollowRequest, ProtocolError, SceneBounds, SocketId, SocketPayload, UserToFollow,
};
use crate::reconcile::reconcile;
use crate::room::{is_follow_room, RoomId, RoomLinkData};
use crate::storage::{SceneStore, StorageBackend, StoreError};
use crate::throttle::Throttle;
use crate::version::{scene_version, Watermark};

const SAVE_FAILED: &str = "Couldn't save to the backend database. If problems persist, save your file locally to make sure you don't lose your work.";
const SAVE_FAILED_TOO_BIG: &str = "Couldn't save to the backend database, the canvas seems to be too big. Save your file locally to make sure you don't lose your work.";
const DECRYPT_FAILED: &str = "Couldn't decrypt data from the room.";

/// Files of non-saved images older than this are fetched on a forced load.
const STALE_PENDING_FILE_MS: u64 = 10_000;

/// Resolved once with the initial scene, or `None` when the room starts
/// from the local scene.
pub type BootstrapReceiver = oneshot::Receiver<Option<Scene>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollabState {
    Idle,
    Starting,
    Collaborating,
    Stopping,
}

/// Which room to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    /// Fresh room id and key.
    NewRoom,
    /// Room from a shared link.
    Existing(RoomLinkData),
    /// User chosen room id, fresh key.
    Named(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorIndicator {
    pub message: String,
    /// Changes on every report so the UI can re-show it.
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub active_collaborators: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadVerdict {
    Allow,
    Prevent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerUpdate {
    pub pointer: Pointer,
    pub button: PointerButton,
    pub selected_element_ids: Vec<ElementId>,
}

/// Signals for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabSignal {
    SceneUpdated(Scene),
    CollaboratorsChanged(Vec<Collaborator>),
    ErrorDialog(Option<String>),
    ErrorIndicator(Option<ErrorIndicator>),
    ActiveRoomLink(Option<String>),
    FollowedBy(Vec<SocketId>),
    ViewportFollow { socket_id: SocketId, bounds: SceneBounds },
    Offline(bool),
    FilesLoaded(Vec<BinaryFile>),
    SessionEnded,
}

/// Requests accepted by [`Collab::run`].
#[derive(Debug)]
pub enum CollabCommand {
    Start {
        target: JoinTarget,
        reply: oneshot::Sender<Result<Option<BootstrapReceiver>, CollabError>>,
    },
    Stop { keep_remote_state: bool },
    SyncElements(Scene),
    AddFiles(Vec<BinaryFile>),
    PointerUpdate { update: PointerUpdate, pointer_count: usize },
    PointerMove,
    VisibilityChange { hidden: bool },
    SetViewport(SceneBounds),
    FollowUser(Option<UserToFollow>),
    SetUsername(String),
    SetOnline(bool),
    FlushSave,
    CloseErrorDialog,
    BeforeUnload { reply: oneshot::Sender<UnloadVerdict> },
    Unload,
    AvailableRooms { reply: oneshot::Sender<Result<Vec<RoomSummary>, CollabError>> },
    Shutdown,
}

/// What woke the loop up.
#[derive(Debug)]
pub enum CollabEvent {
    Socket(SocketEvent),
    Timer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    Transport(ProtocolError),
    Storage(StoreError),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::Transport(e) => write!(f, "Transport error: {e}"),
            CollabError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Transport(e)
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        CollabError::Storage(e)
    }
}

pub struct Collab<S, C: Connector> {
    config: SyncConfig,
    connector: C,
    storage: Arc<S>,
    scene_store: SceneStore<S>,
    file_manager: FileManager,
    portal: Portal<C::Transport>,
    watermark: Watermark,
    session: CollabState,

    scene: Scene,
    files: HashMap<FileId, BinaryFile>,
    username: String,
    collaborators: CollaboratorMap,
    idle: IdleDetector,
    followed_by: Vec<SocketId>,
    user_to_follow: Option<UserToFollow>,
    viewport: Option<SceneBounds>,

    active_room_link: Option<String>,
    room_keys: HashMap<RoomId, RoomKey>,
    existing_room: bool,
    fallback_on_connect_error: bool,
    bootstrap_deadline: Option<Instant>,
    bootstrap_tx: Option<oneshot::Sender<Option<Scene>>>,

    incremental: Throttle<()>,
    full_sync: Throttle<()>,
    save: Throttle<()>,
    pointer: Throttle<PointerUpdate>,
    load_images: Throttle<()>,
    file_upload: Throttle<()>,

    error_message: Option<String>,
    error_indicator: Option<ErrorIndicator>,
    dialog_notified_errors: HashSet<String>,
    rooms_cache: Option<(Instant, Vec<RoomSummary>)>,

    signals: mpsc::UnboundedSender<CollabSignal>,
}

impl<S: StorageBackend, C: Connector> Collab<S, C> {
    pub fn new(config: SyncConfig, connector: C, storage: Arc<S>) -> (Self, mpsc::UnboundedReceiver<CollabSignal>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let collab = Self {
            scene_store: SceneStore::new(storage.clone(), config.max_scene_bytes),
            file_manager: FileManager::new(config.file_upload_max_bytes),
            portal: Portal::new(config.deleted_element_ttl),
            watermark: Watermark::new(),
            session: CollabState::Idle,
            scene: Scene::new(),
            files: HashMap::new(),
            username: String::new(),
            collaborators: CollaboratorMap::new(),
            idle: IdleDetector::new(config.idle_threshold, config.active_threshold),
            followed_by: Vec::new(),
            user_to_follow: None,
            viewport: None,
            active_room_link: None,
            room_keys: HashMap::new(),
            existing_room: false,
            fallback_on_connect_error: false,
            bootstrap_deadline: None,
            bootstrap_tx: None,
            incremental: Throttle::leading(config.min_broadcast_interval),
            full_sync: Throttle::trailing(config.full_sync_interval),
            save: Throttle::trailing(config.save_interval),
            pointer: Throttle::leading(config.cursor_sync_interval),
            load_images: Throttle::trailing(config.load_images_interval),
            file_upload: Throttle::trailing(config.file_upload_interval),
            error_message: None,
            error_indicator: None,
            dialog_notified_errors: HashSet::new(),
            rooms_cache: None,
            signals,
            connector,
            storage,
            config,
        };
        (collab, signals_rx)
    }

    // ─── Accessors ────────────────────────────────────────────────────────

    pub fn session_state(&self) -> CollabState {
        self.session
    }

    pub fn is_collaborating(&self) -> bool {
        matches!(self.session, CollabState::Starting | CollabState::Collaborating)
    }

    pub fn portal_state(&self) -> PortalState {
        self.portal.state()
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn files(&self) -> &HashMap<FileId, BinaryFile> {
        &self.files
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark.get()
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.collaborators.snapshot()
    }

    pub fn active_room_link(&self) -> Option<&str> {
        self.active_room_link.as_deref()
    }

    pub fn current_room_id(&self) -> Option<&str> {
        self.portal.room_id().map(String::as_str)
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.portal.socket_id()
    }

    /// Key of a room joined during this process's lifetime.
    pub fn stored_room_key(&self, room_id: &str) -> Option<&RoomKey> {
        self.room_keys.get(room_id)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn followed_by(&self) -> &[SocketId] {
        &self.followed_by
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_indicator(&self) -> Option<&ErrorIndicator> {
        self.error_indicator.as_ref()
    }

    pub fn close_error_dialog(&mut self) {
        self.set_error_dialog(None);
    }

    /// Whether the current scene is what was last saved for this room.
    /// Always true outside a session.
    pub fn is_saved(&self) -> bool {
        match self.portal.room() {
            Some(room) => self
                .scene_store
                .is_saved(&room.room_id, &self.syncable_elements()),
            None => true,
        }
    }

    // ─── Session lifecycle ────────────────────────────────────────────────

    /// Open a room. Returns `Ok(None)` when a session is already running.
    pub async fn start_collaboration(&mut self, target: JoinTarget) -> Result<Option<BootstrapReceiver>, CollabError> {
        if self.portal.has_transport() {
            return Ok(None);
        }
        if self.username.is_empty() {
            self.username = random_username();
        }

        let (room, existing) = match target {
            JoinTarget::NewRoom => (RoomLinkData::generate(), false),
            JoinTarget::Existing(room) => (room, true),
            JoinTarget::Named(room_id) => (RoomLinkData::new(room_id, RoomKey::generate()), false),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.connector.open(events_tx) {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Failed to open connection: {e}");
                self.set_error_dialog(Some(e.to_string()));
                return Err(e.into());
            }
        };

        let (bootstrap_tx, bootstrap_rx) = oneshot::channel();
        self.bootstrap_tx = Some(bootstrap_tx);
        self.session = CollabState::Starting;
        self.existing_room = existing;
        self.fallback_on_connect_error = true;
        self.room_keys
            .insert(room.room_id.clone(), room.room_key.clone());
        let link = room.to_link(&self.config.base_url);
        log::info!(
            "Starting collaboration in {} room {}",
            if existing { "existing" } else { "new" },
            room.room_id
        );
        self.portal.open(transport, events_rx, room);

        if !existing {
            // Uploaded files belong to the previous context; re-upload them
            let elements = self
                .scene
                .visible()
                .cloned()
                .map(|mut element| {
                    if element.status == Some(FileStatus::Saved) {
                        element.status = Some(FileStatus::Pending);
                        element.bump();
                    }
                    element
                })
                .collect();
            self.scene = Scene::from_sorted(elements);
            self.emit(CollabSignal::SceneUpdated(self.scene.clone()));
            self.save_collab_room().await;
        }

        self.bootstrap_deadline = Some(Instant::now() + self.config.initial_scene_timeout);
        self.active_room_link = Some(link.clone());
        self.emit(CollabSignal::ActiveRoomLink(Some(link)));
        Ok(Some(bootstrap_rx))
    }

    /// Leave the room after a final best-effort save.
    pub async fn stop_collaboration(&mut self, keep_remote_state: bool) {
        if !self.is_collaborating() {
            return;
        }
        log::info!("Stopping collaboration");
        self.session = CollabState::Stopping;
        self.cancel_timers();
        self.reset_error_indicator(true);

        if self.portal.is_initialized() {
            self.save_collab_room().await;
        }

        if keep_remote_state {
            let saved: Vec<ElementId> = self
                .scene
                .iter()
                .filter(|e| e.status == Some(FileStatus::Saved))
                .map(|e| e.id.clone())
                .collect();
            for id in &saved {
                self.scene
                    .mutate(id, |e| e.status = Some(FileStatus::Pending));
            }
            if !saved.is_empty() {
                self.emit(CollabSignal::SceneUpdated(self.scene.clone()));
            }
        }

        self.destroy_socket_client(false);
        self.emit(CollabSignal::SessionEnded);
    }

    /// Page is going away: drop the socket, keep the UI state.
    pub fn on_unload(&mut self) {
        self.cancel_timers();
        self.destroy_socket_client(true);
    }

    pub async fn before_unload(&mut self) -> UnloadVerdict {
        if !self.is_collaborating() {
            return UnloadVerdict::Allow;
        }
        let syncable = self.syncable_elements();
        if self.file_manager.should_prevent_unload(&syncable) || !self.is_saved() {
            self.save_collab_room().await;
            return UnloadVerdict::Prevent;
        }
        UnloadVerdict::Allow
    }

    fn destroy_socket_client(&mut self, is_unload: bool) {
        self.watermark.reset();
        if let Some(room_id) = self.portal.room_id().cloned() {
            self.scene_store.forget(&room_id);
        }
        self.portal.close();
        self.file_manager.reset();
        self.bootstrap_tx = None;
        self.bootstrap_deadline = None;
        self.fallback_on_connect_error = false;
        if !is_unload {
            self.session = CollabState::Idle;
            self.active_room_link = None;
            self.emit(CollabSignal::ActiveRoomLink(None));
            self.collaborators.clear();
            self.emit(CollabSignal::CollaboratorsChanged(Vec::new()));
            self.idle.reset();
            self.followed_by.clear();
            self.user_to_follow = None;
        }
    }

    fn abort_session(&mut self, message: &str) {
        log::error!("Aborting collaboration session: {message}");
        self.session = CollabState::Stopping;
        self.cancel_timers();
        self.set_error_dialog(Some(message.to_string()));
        self.destroy_socket_client(false);
        self.emit(CollabSignal::SessionEnded);
    }

    fn cancel_timers(&mut self) {
        self.incremental.cancel();
        self.full_sync.cancel();
        self.save.cancel();
        self.pointer.cancel();
        self.load_images.cancel();
        self.file_upload.cancel();
        self.bootstrap_deadline = None;
    }

    // ─── Bootstrap ────────────────────────────────────────────────────────

    /// Mark the room initialized, loading the stored scene first when
    /// joining an existing room. Returns the loaded scene.
    async fn initialize_room(&mut self, fetch_scene: bool) -> Option<Scene> {
        self.bootstrap_deadline = None;
        self.fallback_on_connect_error = false;

        let mut loaded = None;
        if fetch_scene && self.existing_room {
            if let Some(room) = self.portal.room().cloned() {
                self.scene = Scene::new();
                match self.scene_store.load(&room).await {
                    Ok(Some(scene)) => {
                        self.watermark.set(scene_version(&scene));
                        loaded = Some(scene);
                    }
                    Ok(None) => log::info!("Room {} has no stored scene", room.room_id),
                    Err(e) => log::error!(
                        "Failed to load room {} from storage, waiting for peers: {e}",
                        room.room_id
                    ),
                }
            }
        }

        self.portal.mark_initialized();
        if self.session == CollabState::Starting {
            self.session = CollabState::Collaborating;
            self.full_sync.trigger(Instant::now(), ());
        }
        loaded
    }

    /// Storage path of the bootstrap race.
    async fn bootstrap_from_storage(&mut self) {
        if self.portal.is_initialized() || !self.is_collaborating() {
            return;
        }
        let existing = self.existing_room;
        let loaded = self.initialize_room(true).await;
        if existing {
            self.scene = loaded.clone().unwrap_or_default();
            self.emit(CollabSignal::SceneUpdated(self.scene.clone()));
            self.fetch_image_files(true).await;
        }
        self.resolve_bootstrap(loaded);
    }

    fn resolve_bootstrap(&mut self, scene: Option<Scene>) {
        if let Some(tx) = self.bootstrap_tx.take() {
            let _ = tx.send(scene);
        }
    }

    // ─── Socket events ────────────────────────────────────────────────────

    pub async fn handle_socket_event(&mut self, event: SocketEvent) {
        if !self.portal.has_transport() {
            return;
        }
        self.portal.handle_transport_event(&event);

        match event {
            SocketEvent::Connected(socket_id) => {
                log::info!("Connected to relay as {socket_id}");
            }
            SocketEvent::ConnectError(message) => {
                log::warn!("Connection error: {message}");
                if self.fallback_on_connect_error {
                    self.bootstrap_from_storage().await;
                }
            }
            SocketEvent::Disconnected => {
                log::warn!("Lost connection to relay, edits stay local");
            }
            SocketEvent::InitRoom => {}
            SocketEvent::FirstInRoom => {
                log::debug!("First in room, loading scene from storage");
                self.bootstrap_from_storage().await;
            }
            SocketEvent::NewUser(socket_id) => {
                log::debug!("New user {socket_id}, sending scene");
                if let Err(e) = self
                    .portal
                    .broadcast_scene(SceneBroadcast::Init, &self.scene, true)
                {
                    log::warn!("Failed to send scene to new user: {e}");
                }
            }
            SocketEvent::RoomUserChange(socket_ids) => {
                self.collaborators
                    .set_members(&socket_ids, self.portal.socket_id());
                self.emit_collaborators();
            }
            SocketEvent::ClientBroadcast { iv, ciphertext } => {
                self.handle_client_broadcast(&iv, &ciphertext).await;
            }
            SocketEvent::UserFollowRoomChange(followed_by) => {
                self.followed_by = followed_by.clone();
                self.emit(CollabSignal::FollowedBy(followed_by));
                self.relay_visible_scene_bounds(true);
            }
        }
    }

    async fn handle_client_broadcast(&mut self, iv: &[u8], ciphertext: &[u8]) {
        let payload = match self.portal.decode(iv, ciphertext) {
            Ok(payload) => payload,
            Err(PortalError::Crypto(e)) => {
                log::error!("Failed to decrypt room message: {e}");
                self.abort_session(DECRYPT_FAILED);
                return;
            }
            Err(e) => {
                log::warn!("Dropping malformed room message: {e}");
                return;
            }
        };

        match payload {
            SocketPayload::SceneInit { elements } => {
                if self.portal.is_initialized() {
                    self.apply_remote_update(&elements);
                    return;
                }
                self.initialize_room(false).await;
                let merged = self.reconcile_remote(&elements);
                self.apply_remote_scene(merged.clone());
                self.fetch_image_files(true).await;
                self.resolve_bootstrap(Some(merged));
            }
            SocketPayload::SceneUpdate { elements } => {
                self.apply_remote_update(&elements);
            }
            SocketPayload::MouseLocation(location) => {
                self.collaborators.update(
                    &location.socket_id,
                    CollaboratorPatch {
                        pointer: Some(location.pointer),
                        button: Some(location.button),
                        selected_element_ids: Some(location.selected_element_ids),
                        username: Some(location.username),
                        user_state: None,
                    },
                    self.portal.socket_id(),
                );
                self.emit_collaborators();
            }
            SocketPayload::IdleStatus(status) => {
                self.collaborators.update(
                    &status.socket_id,
                    CollaboratorPatch {
                        user_state: Some(status.user_state),
                        username: Some(status.username),
                        ..CollaboratorPatch::default()
                    },
                    self.portal.socket_id(),
                );
                self.emit_collaborators();
            }
            SocketPayload::VisibleSceneBounds(bounds) => {
                let Some(target) = &self.user_to_follow else {
                    return;
                };
                if target.socket_id != bounds.socket_id {
                    log::warn!(
                        "Ignoring bounds from {}, following {}",
                        bounds.socket_id,
                        target.socket_id
                    );
                    return;
                }
                // Mutual follow would bounce viewports forever
                if self.followed_by.contains(&target.socket_id) {
                    return;
                }
                self.emit(CollabSignal::ViewportFollow {
                    socket_id: bounds.socket_id,
                    bounds: bounds.scene_bounds,
                });
            }
        }
    }

    /// Merge remote elements and move the watermark to the merged version
    /// before anyone sees the new scene.
    ///
    /// A local edit still waiting in the incremental throttle goes out
    /// first: the merged version covers it, so the watermark would hold it
    /// back afterwards.
    fn reconcile_remote(&mut self, remote: &Scene) -> Scene {
        if self.incremental.flush(Instant::now()).is_some() {
            self.send_incremental();
        }
        let merged = reconcile(&self.scene, remote);
        self.watermark.set(scene_version(&merged));
        merged
    }

    fn apply_remote_update(&mut self, remote: &Scene) {
        let merged = self.reconcile_remote(remote);
        self.apply_remote_scene(merged);
    }

    fn apply_remote_scene(&mut self, scene: Scene) {
        self.scene = scene;
        self.emit(CollabSignal::SceneUpdated(self.scene.clone()));
        self.load_images.trigger(Instant::now(), ());
    }

    // ─── Local edits & broadcast ──────────────────────────────────────────

    /// A local change to the scene.
    pub fn sync_elements(&mut self, scene: Scene) {
        self.scene = scene;
        if !self.is_collaborating() {
            return;
        }
        self.broadcast_elements();
        self.queue_save();
    }

    fn broadcast_elements(&mut self) {
        if !self.watermark.should_broadcast(scene_version(&self.scene)) {
            return;
        }
        if self.incremental.trigger(Instant::now(), ()).is_some() {
            self.send_incremental();
        }
    }

    fn send_incremental(&mut self) {
        let version = scene_version(&self.scene);
        if !self.watermark.should_broadcast(version) {
            return;
        }
        match self
            .portal
            .broadcast_scene(SceneBroadcast::Update, &self.scene, false)
        {
            Ok(_) => {
                self.watermark.set(version);
                self.file_upload.trigger(Instant::now(), ());
            }
            Err(PortalError::NotOpen) => log::trace!("Not connected, update stays local"),
            Err(e) => log::warn!("Failed to broadcast scene update: {e}"),
        }
    }

    /// Anti-entropy: re-send every syncable element, then re-arm.
    fn broadcast_all_elements(&mut self) {
        if self.session != CollabState::Collaborating {
            return;
        }
        match self
            .portal
            .broadcast_scene(SceneBroadcast::Update, &self.scene, true)
        {
            Ok(sent) => {
                log::debug!("Full scene sync of {sent} elements");
                self.watermark.raise(scene_version(&self.scene));
            }
            Err(PortalError::NotOpen) => log::trace!("Not connected, skipping full sync"),
            Err(e) => log::warn!("Failed to broadcast full scene: {e}"),
        }
        self.full_sync.trigger(Instant::now(), ());
    }

    /// Send the full scene now instead of waiting for the next interval.
    pub fn flush_full_sync(&mut self) {
        if self.full_sync.flush(Instant::now()).is_some() {
            self.broadcast_all_elements();
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────────

    pub fn queue_save(&mut self) {
        if self.is_collaborating() {
            self.save.trigger(Instant::now(), ());
        }
    }

    /// Save now, dropping any pending throttled save.
    pub async fn flush_save(&mut self) {
        self.save.cancel();
        self.save_if_initialized().await;
    }

    async fn save_if_initialized(&mut self) {
        if self.portal.is_initialized() {
            self.save_collab_room().await;
        }
    }

    async fn save_collab_room(&mut self) {
        let Some(room) = self.portal.room().cloned() else {
            return;
        };
        let elements = self.syncable_elements();
        let in_flight = scene_version(&elements);

        match self.scene_store.save(&room, &elements).await {
            Ok(outcome) => {
                self.reset_error_indicator(false);
                if let Some(outcome) = outcome {
                    if self.is_collaborating() && outcome.scene_version != in_flight {
                        log::debug!(
                            "Stored scene was ahead ({} vs {in_flight}), merging",
                            outcome.scene_version
                        );
                        self.apply_remote_update(&outcome.scene);
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to save room {}: {e}", room.room_id);
                self.report_save_error(&e);
            }
        }
    }

    fn report_save_error(&mut self, error: &StoreError) {
        let message = if error.is_size_exceeded() {
            SAVE_FAILED_TOO_BIG
        } else {
            SAVE_FAILED
        };
        if !self.dialog_notified_errors.contains(message) || !self.is_collaborating() {
            self.set_error_dialog(Some(message.to_string()));
            self.dialog_notified_errors.insert(message.to_string());
        }
        if self.is_collaborating() {
            let indicator = ErrorIndicator {
                message: message.to_string(),
                nonce: now_millis(),
            };
            self.error_indicator = Some(indicator.clone());
            self.emit(CollabSignal::ErrorIndicator(Some(indicator)));
        }
    }

    fn reset_error_indicator(&mut self, reset_dialog_notified: bool) {
        if self.error_indicator.take().is_some() {
            self.emit(CollabSignal::ErrorIndicator(None));
        }
        if reset_dialog_notified {
            self.dialog_notified_errors.clear();
        }
    }

    fn set_error_dialog(&mut self, message: Option<String>) {
        self.error_message = message.clone();
        self.emit(CollabSignal::ErrorDialog(message));
    }

    fn syncable_elements(&self) -> Scene {
        self.scene
            .syncable(now_millis(), self.config.deleted_element_ttl)
    }

    // ─── Files ────────────────────────────────────────────────────────────

    /// Register local file data referenced by image elements.
    pub fn add_files(&mut self, files: Vec<BinaryFile>) {
        for file in files {
            self.files.insert(file.id.clone(), file);
        }
        if self.is_collaborating() {
            self.file_upload.trigger(Instant::now(), ());
        }
    }

    async fn upload_pending_files(&mut self) {
        let Some(room) = self.portal.room().cloned() else {
            return;
        };
        let pending: Vec<BinaryFile> = self
            .scene
            .visible()
            .filter(|e| e.status == Some(FileStatus::Pending))
            .filter_map(|e| e.file_id.as_deref())
            .filter(|id| !self.file_manager.is_file_handled(id))
            .filter_map(|id| self.files.get(id).cloned())
            .collect();
        if pending.is_empty() {
            return;
        }

        let report = self
            .file_manager
            .save_files(self.storage.as_ref(), &room, pending)
            .await;
        let mut changed = false;
        for id in &report.saved {
            changed |= self.set_file_status(id, FileStatus::Saved);
        }
        for id in &report.errored {
            changed |= self.set_file_status(id, FileStatus::Error);
        }
        if changed {
            self.local_scene_changed();
        }
    }

    async fn fetch_image_files(&mut self, force: bool) {
        let Some(room) = self.portal.room().cloned() else {
            return;
        };
        let now = now_millis();
        let mut ids: Vec<FileId> = self
            .scene
            .visible()
            .filter(|e| match e.status {
                Some(FileStatus::Saved) => true,
                status if force => {
                    status != Some(FileStatus::Pending)
                        || now.saturating_sub(e.updated) > STALE_PENDING_FILE_MS
                }
                _ => false,
            })
            .filter_map(|e| e.file_id.clone())
            .filter(|id| !self.file_manager.is_file_handled(id) && !self.files.contains_key(id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return;
        }

        let report = self
            .file_manager
            .get_files(self.storage.as_ref(), &room, ids)
            .await;
        if !report.loaded.is_empty() {
            for file in &report.loaded {
                self.files.insert(file.id.clone(), file.clone());
            }
            self.emit(CollabSignal::FilesLoaded(report.loaded));
        }
        let mut changed = false;
        for id in &report.errored {
            changed |= self.set_file_status(id, FileStatus::Error);
        }
        if changed {
            self.local_scene_changed();
        }
    }

    fn set_file_status(&mut self, file_id: &str, status: FileStatus) -> bool {
        let ids: Vec<ElementId> = self
            .scene
            .iter()
            .filter(|e| e.file_id.as_deref() == Some(file_id) && e.status != Some(status))
            .map(|e| e.id.clone())
            .collect();
        for id in &ids {
            self.scene.mutate(id, |e| e.status = Some(status));
        }
        !ids.is_empty()
    }

    /// The coordinator itself edited the scene.
    fn local_scene_changed(&mut self) {
        self.emit(CollabSignal::SceneUpdated(self.scene.clone()));
        self.broadcast_elements();
        self.queue_save();
    }

    // ─── Presence ─────────────────────────────────────────────────────────

    /// Local pointer moved. Multi-touch gestures are not broadcast.
    pub fn on_pointer_update(&mut self, update: PointerUpdate, pointer_count: usize) {
        if !self.is_collaborating() || pointer_count >= 2 {
            return;
        }
        if let Some(update) = self.pointer.trigger(Instant::now(), update) {
            self.send_pointer(update);
        }
    }

    fn send_pointer(&mut self, update: PointerUpdate) {
        if let Err(e) = self.portal.broadcast_mouse_location(
            update.pointer,
            update.button,
            update.selected_element_ids,
            &self.username,
        ) {
            log::trace!("Pointer update not sent: {e}");
        }
    }

    /// Any pointer activity, for idle detection.
    pub fn on_pointer_move(&mut self) {
        if !self.is_collaborating() {
            return;
        }
        if let Some(state) = self.idle.on_pointer_move(Instant::now()) {
            self.broadcast_idle_state(state);
        }
    }

    pub fn on_visibility_change(&mut self, hidden: bool) {
        if !self.is_collaborating() {
            return;
        }
        if let Some(state) = self.idle.on_visibility_change(hidden, Instant::now()) {
            self.broadcast_idle_state(state);
        }
    }

    pub fn idle_state(&self) -> UserIdleState {
        self.idle.state()
    }

    fn broadcast_idle_state(&mut self, state: UserIdleState) {
        if let Err(e) = self.portal.broadcast_idle_change(state, &self.username) {
            log::trace!("Idle state not sent: {e}");
        }
    }

    fn emit_collaborators(&self) {
        self.emit(CollabSignal::CollaboratorsChanged(self.collaborators.snapshot()));
    }

    // ─── Follow mode ──────────────────────────────────────────────────────

    /// Start following `target`, or stop following with `None`.
    pub fn follow_user(&mut self, target: Option<UserToFollow>) {
        if let Some(previous) = self.user_to_follow.take() {
            if target.as_ref() == Some(&previous) {
                self.user_to_follow = Some(previous);
                return;
            }
            self.send_follow(previous, FollowAction::Unfollow);
        }
        if let Some(target) = target {
            self.user_to_follow = Some(target.clone());
            self.send_follow(target, FollowAction::Follow);
        }
    }

    fn send_follow(&mut self, user_to_follow: UserToFollow, action: FollowAction) {
        let request = FollowRequest { user_to_follow, action };
        if let Err(e) = self.portal.broadcast_user_followed(request) {
            log::warn!("Failed to send follow request: {e}");
        }
    }

    pub fn set_viewport(&mut self, bounds: SceneBounds) {
        self.viewport = Some(bounds);
        self.relay_visible_scene_bounds(false);
    }

    fn relay_visible_scene_bounds(&mut self, force: bool) {
        let Some(bounds) = self.viewport else {
            return;
        };
        if !force && self.followed_by.is_empty() {
            return;
        }
        if let Err(e) = self
            .portal
            .broadcast_visible_scene_bounds(bounds, &self.username)
        {
            log::trace!("Viewport not relayed: {e}");
        }
    }

    // ─── Misc ─────────────────────────────────────────────────────────────

    pub fn set_online(&mut self, online: bool) {
        if !online {
            log::warn!("Network offline");
        }
        self.emit(CollabSignal::Offline(!online));
    }

    /// Rooms known to storage with their live member counts.
    pub async fn get_available_rooms(&mut self) -> Result<Vec<RoomSummary>, CollabError> {
        let now = Instant::now();
        if let Some((fetched_at, rooms)) = &self.rooms_cache {
            if now < *fetched_at + self.config.rooms_query_interval {
                return Ok(rooms.clone());
            }
        }

        let stored = self.scene_store.rooms().await?;
        let active: HashMap<RoomId, usize> = match self.connector.active_rooms().await {
            Ok(rooms) => rooms
                .into_iter()
                .filter(|(room_id, _)| !is_follow_room(room_id))
                .collect(),
            Err(e) => {
                log::warn!("Failed to query active rooms: {e}");
                HashMap::new()
            }
        };
        let rooms: Vec<RoomSummary> = stored
            .into_iter()
            .map(|room_id| RoomSummary {
                active_collaborators: active.get(&room_id).copied().unwrap_or(0),
                room_id,
            })
            .collect();
        self.rooms_cache = Some((now, rooms.clone()));
        Ok(rooms)
    }

    // ─── Event loop ───────────────────────────────────────────────────────

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.bootstrap_deadline,
            self.incremental.deadline(),
            self.full_sync.deadline(),
            self.save.deadline(),
            self.pointer.deadline(),
            self.load_images.deadline(),
            self.file_upload.deadline(),
            self.idle.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every timer whose deadline has passed.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        if self.bootstrap_deadline.is_some_and(|d| now >= d) {
            self.bootstrap_deadline = None;
            log::info!("No scene from peers in time, loading from storage");
            self.bootstrap_from_storage().await;
        }
        if self.incremental.poll(now).is_some() {
            self.send_incremental();
        }
        if self.full_sync.poll(now).is_some() {
            self.broadcast_all_elements();
        }
        if let Some(update) = self.pointer.poll(now) {
            self.send_pointer(update);
        }
        if let Some(state) = self.idle.poll(now) {
            self.broadcast_idle_state(state);
        }
        if self.save.poll(now).is_some() {
            self.save_if_initialized().await;
        }
        if self.load_images.poll(now).is_some() {
            self.fetch_image_files(false).await;
        }
        if self.file_upload.poll(now).is_some() {
            self.upload_pending_files().await;
        }
    }

    /// Wait for the next socket event or timer.
    pub async fn next_event(&mut self) -> CollabEvent {
        let deadline = self.next_deadline();
        tokio::select! {
            event = self.portal.next_event() => CollabEvent::Socket(event),
            _ = sleep_until_deadline(deadline) => CollabEvent::Timer,
        }
    }

    pub async fn handle_event(&mut self, event: CollabEvent) {
        match event {
            CollabEvent::Socket(event) => self.handle_socket_event(event).await,
            CollabEvent::Timer => self.tick().await,
        }
    }

    /// Drive the session until `Shutdown` or until every command sender is
    /// gone. A running session is stopped on the way out.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CollabCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CollabCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = self.next_event() => self.handle_event(event).await,
            }
        }
        self.stop_collaboration(false).await;
    }

    pub async fn handle_command(&mut self, command: CollabCommand) {
        match command {
            CollabCommand::Start { target, reply } => {
                let _ = reply.send(self.start_collaboration(target).await);
            }
            CollabCommand::Stop { keep_remote_state } => {
                self.stop_collaboration(keep_remote_state).await;
            }
            CollabCommand::SyncElements(scene) => self.sync_elements(scene),
            CollabCommand::AddFiles(files) => self.add_files(files),
            CollabCommand::PointerUpdate { update, pointer_count } => {
                self.on_pointer_update(update, pointer_count);
            }
            CollabCommand::PointerMove => self.on_pointer_move(),
            CollabCommand::VisibilityChange { hidden } => self.on_visibility_change(hidden),
            CollabCommand::SetViewport(bounds) => self.set_viewport(bounds),
            CollabCommand::FollowUser(target) => self.follow_user(target),
            CollabCommand::SetUsername(username) => self.set_username(username),
            CollabCommand::SetOnline(online) => self.set_online(online),
            CollabCommand::FlushSave => self.flush_save().await,
            CollabCommand::CloseErrorDialog => self.close_error_dialog(),
            CollabCommand::BeforeUnload { reply } => {
                let _ = reply.send(self.before_unload().await);
            }
            CollabCommand::Unload => self.on_unload(),
            CollabCommand::AvailableRooms { reply } => {
                let _ = reply.send(self.get_available_rooms().await);
            }
            CollabCommand::Shutdown => {}
        }
    }

    fn emit(&self, signal: CollabSignal) {
        let _ = self.signals.send(signal);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn random_username() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("Anonymous {}", &id[..4])
}
