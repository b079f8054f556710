//! Persistence for collaboration rooms.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  StoredScene   ┌──────────────┐   get/set/has/keys   ┌────────────────┐
//! │   Collab    │ ─────────────► │  SceneStore  │ ───────────────────► │ StorageBackend │
//! │ coordinator │                │ (reconcile + │                      │  MemoryStore   │
//! └──────┬──────┘                │  encrypt)    │                      │  RocksStore    │
//!        │ files                 └──────────────┘                      │  RemoteStore   │
//!        ▼                                                             └────────────────┘
//! ┌─────────────┐          FILES namespace                                     ▲
//! │ FileManager │ ─────────────────────────────────────────────────────────────┘
//! └─────────────┘
//! ```
//!
//! Backends are plain key-value stores split into three namespaces. They
//! only ever hold ciphertext.

pub mod memory;
pub mod rocks;
pub mod scene;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoError;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use scene::{SaveOutcome, SceneStore, StoredScene};

/// Key space of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Encrypted scene snapshots, keyed by room id.
    Scenes,
    /// Known room ids.
    Rooms,
    /// Encrypted file attachments.
    Files,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Scenes, Namespace::Rooms, Namespace::Files];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Scenes => "SCENES",
            Namespace::Rooms => "ROOMS",
            Namespace::Files => "FILES",
        }
    }
}

/// Key-value persistence service.
pub trait StorageBackend: Send + Sync {
    fn get(
        &self,
        key: &str,
        namespace: Namespace,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        namespace: Namespace,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn has(&self, key: &str, namespace: Namespace) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn keys(&self, namespace: Namespace) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// Key not present
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Payload rejected by the size limit
    PayloadTooLarge { size: usize, limit: usize },
    Crypto(CryptoError),
    /// Remote backend unreachable or refused the request
    Remote(String),
}

impl StoreError {
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, StoreError::PayloadTooLarge { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(key) => write!(f, "Not found: {key}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::PayloadTooLarge { size, limit } => {
                write!(f, "Payload is longer than {limit} bytes ({size} bytes)")
            }
            StoreError::Crypto(e) => write!(f, "Crypto error: {e}"),
            StoreError::Remote(e) => write!(f, "Remote storage error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        StoreError::Crypto(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_names() {
        let names: Vec<_> = Namespace::ALL.iter().map(Namespace::as_str).collect();
        assert_eq!(names, ["SCENES", "ROOMS", "FILES"]);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::PayloadTooLarge { size: 10, limit: 5 };
        assert!(err.is_size_exceeded());
        assert!(err.to_string().contains("longer than 5 bytes"));

        let err = StoreError::DatabaseError("test".into());
        assert!(err.to_string().contains("Database error"));
        assert!(!err.is_size_exceeded());
    }
}
