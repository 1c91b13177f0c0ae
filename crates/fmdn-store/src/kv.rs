//! # Key-Value Contract
//!
//! The minimal persistence surface the push runtime depends on. Values are
//! opaque strings (the runtime stores JSON); namespaces isolate tenants.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreResult;

/// Async namespaced key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value. Absent keys yield `Ok(None)`.
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>>;

    /// Writes a value, replacing any previous one.
    async fn set(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Removes a value. Removing an absent key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()>;
}

// =============================================================================
// Memory Store
// =============================================================================

/// Process-local store. Used by tests and by hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries across all namespaces.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_namespaces_are_isolated() {
        let store = MemoryStore::new();
        store.set("alice", "fcm_credentials", "a").await.unwrap();
        store.set("bob", "fcm_credentials", "b").await.unwrap();

        assert_eq!(store.get("alice", "fcm_credentials").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("bob", "fcm_credentials").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.get("carol", "fcm_credentials").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_overwrite_and_delete() {
        let store = MemoryStore::new();
        store.set("t", "k", "1").await.unwrap();
        store.set("t", "k", "2").await.unwrap();
        assert_eq!(store.get("t", "k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.len().await, 1);

        store.delete("t", "k").await.unwrap();
        store.delete("t", "k").await.unwrap();
        assert!(store.is_empty().await);
    }
}
