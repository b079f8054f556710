//! Binary file attachments of image elements.
//!
//! Files are bincode-encoded, LZ4-compressed, then sealed with the room key
//! and stored as `iv || ciphertext` under `files/rooms/<roomId>/<fileId>`.
//! The manager remembers which ids are in flight, saved or broken so the
//! coordinator never fetches or uploads the same file twice.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, IV_LENGTH};
use crate::element::{FileId, Scene};
use crate::room::RoomLinkData;
use crate::storage::{Namespace, StorageBackend, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryFile {
    pub id: FileId,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Milliseconds since the epoch
    pub created: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSaveReport {
    pub saved: Vec<FileId>,
    pub errored: Vec<FileId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileLoadReport {
    pub loaded: Vec<BinaryFile>,
    pub errored: Vec<FileId>,
}

pub fn file_key(room_id: &str, file_id: &str) -> String {
    format!("files/rooms/{room_id}/{file_id}")
}

#[derive(Debug)]
pub struct FileManager {
    fetching: HashSet<FileId>,
    saving: HashSet<FileId>,
    saved: HashSet<FileId>,
    errored: HashSet<FileId>,
    max_bytes: usize,
}

impl FileManager {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            fetching: HashSet::new(),
            saving: HashSet::new(),
            saved: HashSet::new(),
            errored: HashSet::new(),
            max_bytes,
        }
    }

    /// In flight, saved, or known broken.
    pub fn is_file_handled(&self, id: &str) -> bool {
        self.fetching.contains(id)
            || self.saving.contains(id)
            || self.saved.contains(id)
            || self.errored.contains(id)
    }

    pub fn is_saved(&self, id: &str) -> bool {
        self.saved.contains(id)
    }

    /// A visible image in the scene is still uploading.
    pub fn should_prevent_unload(&self, scene: &Scene) -> bool {
        scene
            .visible()
            .filter_map(|e| e.file_id.as_deref())
            .any(|id| self.saving.contains(id))
    }

    pub async fn save_files<S: StorageBackend>(
        &mut self,
        storage: &S,
        room: &RoomLinkData,
        files: Vec<BinaryFile>,
    ) -> FileSaveReport {
        let mut report = FileSaveReport::default();
        for file in files {
            if self.is_file_handled(&file.id) {
                continue;
            }
            self.saving.insert(file.id.clone());
            let result = self.store_file(storage, room, &file).await;
            self.saving.remove(&file.id);
            match result {
                Ok(()) => {
                    self.saved.insert(file.id.clone());
                    report.saved.push(file.id);
                }
                Err(e) => {
                    log::warn!("Failed to save file {}: {e}", file.id);
                    self.errored.insert(file.id.clone());
                    report.errored.push(file.id);
                }
            }
        }
        report
    }

    pub async fn get_files<S: StorageBackend>(
        &mut self,
        storage: &S,
        room: &RoomLinkData,
        ids: Vec<FileId>,
    ) -> FileLoadReport {
        let mut report = FileLoadReport::default();
        for id in ids {
            if self.fetching.contains(&id) {
                continue;
            }
            self.fetching.insert(id.clone());
            let result = self.load_file(storage, room, &id).await;
            self.fetching.remove(&id);
            match result {
                Ok(file) => {
                    self.saved.insert(id);
                    report.loaded.push(file);
                }
                Err(e) => {
                    log::warn!("Failed to load file {id}: {e}");
                    self.errored.insert(id.clone());
                    report.errored.push(id);
                }
            }
        }
        report
    }

    /// Forget everything, e.g. when the session ends.
    pub fn reset(&mut self) {
        self.fetching.clear();
        self.saving.clear();
        self.saved.clear();
        self.errored.clear();
    }

    async fn store_file<S: StorageBackend>(
        &self,
        storage: &S,
        room: &RoomLinkData,
        file: &BinaryFile,
    ) -> Result<(), StoreError> {
        let encoded = bincode::serde::encode_to_vec(file, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);
        let sealed = crypto::encrypt(&room.room_key, &compressed)?;

        let mut blob = Vec::with_capacity(IV_LENGTH + sealed.ciphertext.len());
        blob.extend_from_slice(&sealed.iv);
        blob.extend_from_slice(&sealed.ciphertext);
        if blob.len() > self.max_bytes {
            return Err(StoreError::PayloadTooLarge {
                size: blob.len(),
                limit: self.max_bytes,
            });
        }

        storage
            .set(&file_key(&room.room_id, &file.id), blob, Namespace::Files)
            .await
    }

    async fn load_file<S: StorageBackend>(
        &self,
        storage: &S,
        room: &RoomLinkData,
        id: &str,
    ) -> Result<BinaryFile, StoreError> {
        let key = file_key(&room.room_id, id);
        let blob = storage
            .get(&key, Namespace::Files)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if blob.len() < IV_LENGTH {
            return Err(StoreError::DeserializationError(format!("file blob {key} too short")));
        }
        let (iv, ciphertext) = blob.split_at(IV_LENGTH);
        let compressed = crypto::decrypt(&room.room_key, iv, ciphertext)?;
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (file, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::storage::MemoryStore;

    fn file(id: &str, len: usize) -> BinaryFile {
        BinaryFile {
            id: id.into(),
            mime_type: "image/png".into(),
            data: vec![7; len],
            created: 1,
        }
    }

    #[tokio::test]
    async fn test_save_and_fetch() {
        let storage = MemoryStore::new();
        let room = RoomLinkData::generate();
        let mut uploader = FileManager::new(64 * 1024);
        let report = uploader
            .save_files(&storage, &room, vec![file("f1", 1000)])
            .await;
        assert_eq!(report.saved, ["f1"]);
        assert!(uploader.is_saved("f1"));

        let key = file_key(&room.room_id, "f1");
        assert!(storage.has(&key, Namespace::Files).await.unwrap());

        let mut reader = FileManager::new(64 * 1024);
        let loaded = reader.get_files(&storage, &room, vec!["f1".into()]).await;
        assert_eq!(loaded.loaded, vec![file("f1", 1000)]);
        assert!(reader.is_file_handled("f1"));
    }

    #[tokio::test]
    async fn test_handled_files_not_resaved() {
        let storage = MemoryStore::new();
        let room = RoomLinkData::generate();
        let mut manager = FileManager::new(64 * 1024);
        manager.save_files(&storage, &room, vec![file("f1", 10)]).await;
        let again = manager.save_files(&storage, &room, vec![file("f1", 10)]).await;
        assert!(again.saved.is_empty());
        assert!(again.errored.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_file_errors() {
        let storage = MemoryStore::new();
        let room = RoomLinkData::generate();
        let mut manager = FileManager::new(32);
        // Incompressible-ish payload
        let mut big = file("big", 256);
        big.data = (0..=255u8).collect();
        let report = manager.save_files(&storage, &room, vec![big]).await;
        assert_eq!(report.errored, ["big"]);
        assert!(manager.is_file_handled("big"));
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let storage = MemoryStore::new();
        let room = RoomLinkData::generate();
        let mut manager = FileManager::new(1024);
        let report = manager.get_files(&storage, &room, vec!["nope".into()]).await;
        assert_eq!(report.errored, ["nope"]);
    }

    #[tokio::test]
    async fn test_wrong_room_key_errors() {
        let storage = MemoryStore::new();
        let room = RoomLinkData::generate();
        let mut manager = FileManager::new(64 * 1024);
        manager.save_files(&storage, &room, vec![file("f", 10)]).await;

        let intruder = RoomLinkData::new(room.room_id.clone(), crate::crypto::RoomKey::generate());
        let mut other = FileManager::new(64 * 1024);
        let report = other.get_files(&storage, &intruder, vec!["f".into()]).await;
        assert_eq!(report.errored, ["f"]);
    }

    #[test]
    fn test_prevent_unload_while_saving() {
        let mut manager = FileManager::new(1024);
        let scene = Scene::from_ordered(vec![Element::image("img", "f1")]).unwrap();
        assert!(!manager.should_prevent_unload(&scene));
        manager.saving.insert("f1".into());
        assert!(manager.should_prevent_unload(&scene));
        manager.reset();
        assert!(!manager.should_prevent_unload(&scene));
    }
}
