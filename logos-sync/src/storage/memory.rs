//! In-process storage backend.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{Namespace, StorageBackend, StoreError};

/// Volatile store, one map per namespace. Shared between sessions through
/// an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(Namespace, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl StorageBackend for MemoryStore {
    async fn get(&self, key: &str, namespace: Namespace) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace, key.to_string()))
            .cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, namespace: Namespace) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert((namespace, key.to_string()), value);
        Ok(())
    }

    async fn has(&self, key: &str, namespace: Namespace) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(namespace, key.to_string()))
            .is_some_and(|v| !v.is_empty()))
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a", Namespace::Scenes).await.unwrap(), None);
        store.set("a", vec![1, 2], Namespace::Scenes).await.unwrap();
        assert_eq!(store.get("a", Namespace::Scenes).await.unwrap(), Some(vec![1, 2]));
        assert!(store.has("a", Namespace::Scenes).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_isolated() {
        let store = MemoryStore::new();
        store.set("room", vec![1], Namespace::Rooms).await.unwrap();
        assert!(!store.has("room", Namespace::Scenes).await.unwrap());
        assert_eq!(store.keys(Namespace::Rooms).await.unwrap(), ["room"]);
        assert!(store.keys(Namespace::Files).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_value_is_absent() {
        let store = MemoryStore::new();
        store.set("k", Vec::new(), Namespace::Files).await.unwrap();
        assert!(!store.has("k", Namespace::Files).await.unwrap());
    }
}
