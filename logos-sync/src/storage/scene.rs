//! Encrypted scene snapshots on top of a [`StorageBackend`].
//!
//! Saving is read-reconcile-write: the stored snapshot is merged with the
//! scene being saved, so a peer that saves late never clobbers edits
//! another peer persisted first. The caller gets the merged scene back and
//! folds it into its local state when it differs from what it sent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Namespace, StorageBackend, StoreError};
use crate::crypto::{self, RoomKey};
use crate::element::{now_millis, Scene};
use crate::reconcile::reconcile;
use crate::room::{RoomId, RoomLinkData};
use crate::version::scene_version;

/// Snapshot record as persisted in the `SCENES` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredScene {
    pub scene_version: u64,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl StoredScene {
    fn seal(key: &RoomKey, scene: &Scene) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(scene).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let sealed = crypto::encrypt(key, &json)?;
        Ok(Self {
            scene_version: scene_version(scene),
            iv: sealed.iv.to_vec(),
            ciphertext: sealed.ciphertext,
        })
    }

    fn open(&self, key: &RoomKey) -> Result<Scene, StoreError> {
        let json = crypto::decrypt(key, &self.iv, &self.ciphertext)?;
        serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (stored, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(stored)
    }
}

/// Result of a save that actually wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// Scene as now stored, after merging with the previous snapshot.
    pub scene: Scene,
    pub scene_version: u64,
}

pub struct SceneStore<S> {
    backend: Arc<S>,
    /// Last saved version per room, to skip redundant writes.
    saved_versions: HashMap<RoomId, u64>,
    max_scene_bytes: usize,
}

impl<S: StorageBackend> SceneStore<S> {
    pub fn new(backend: Arc<S>, max_scene_bytes: usize) -> Self {
        Self {
            backend,
            saved_versions: HashMap::new(),
            max_scene_bytes,
        }
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.backend
    }

    /// Whether `scene` is exactly what this session last saved or loaded.
    pub fn is_saved(&self, room_id: &str, scene: &Scene) -> bool {
        self.saved_versions.get(room_id) == Some(&scene_version(scene))
    }

    /// Drop the cached version for a room, e.g. when its session ends.
    pub fn forget(&mut self, room_id: &str) {
        self.saved_versions.remove(room_id);
    }

    pub async fn load(&mut self, room: &RoomLinkData) -> Result<Option<Scene>, StoreError> {
        let Some(stored) = self.fetch(room).await? else {
            return Ok(None);
        };
        self.saved_versions
            .insert(room.room_id.clone(), scene_version(&stored));
        log::debug!(
            "Loaded room {} ({} elements)",
            room.room_id,
            stored.len()
        );
        Ok(Some(stored))
    }

    /// Persist `scene`, merged with whatever is stored. `Ok(None)` when the
    /// scene is already saved.
    pub async fn save(&mut self, room: &RoomLinkData, scene: &Scene) -> Result<Option<SaveOutcome>, StoreError> {
        if self.is_saved(&room.room_id, scene) {
            return Ok(None);
        }

        let merged = match self.fetch(room).await? {
            Some(stored) => reconcile(scene, &stored),
            None => scene.clone(),
        };
        let record = StoredScene::seal(&room.room_key, &merged)?;
        let bytes = record.encode()?;
        if bytes.len() > self.max_scene_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_scene_bytes,
            });
        }

        self.backend
            .set(&room.room_id, bytes, Namespace::Scenes)
            .await?;
        if !self.backend.has(&room.room_id, Namespace::Rooms).await? {
            self.backend
                .set(&room.room_id, now_millis().to_be_bytes().to_vec(), Namespace::Rooms)
                .await?;
        }

        self.saved_versions
            .insert(room.room_id.clone(), record.scene_version);
        log::debug!(
            "Saved room {} at version {}",
            room.room_id,
            record.scene_version
        );
        Ok(Some(SaveOutcome {
            scene: merged,
            scene_version: record.scene_version,
        }))
    }

    /// Room ids known to storage.
    pub async fn rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        self.backend.keys(Namespace::Rooms).await
    }

    async fn fetch(&self, room: &RoomLinkData) -> Result<Option<Scene>, StoreError> {
        match self.backend.get(&room.room_id, Namespace::Scenes).await? {
            Some(bytes) if !bytes.is_empty() => {
                let stored = StoredScene::decode(&bytes)?;
                Ok(Some(stored.open(&room.room_key)?))
            }
            _ => Ok(None),
        }
    }
}
