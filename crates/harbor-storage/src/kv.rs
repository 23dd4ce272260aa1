//! Async key-value store abstraction
//!
//! Keys and values are strings; no atomicity across keys is assumed beyond
//! what an individual backend documents.

use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Persistent string key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a single value, replacing any previous value
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Read several values, in key order
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write several values
    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    /// Remove a key; removing an absent key succeeds
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove several keys independently
    ///
    /// Every key is attempted; the first failure is returned afterwards.
    async fn multi_remove(&self, keys: &[String]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to remove key");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no keys are stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True when `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn multi_set(&self, entries: Vec<(String, String)>) -> Result<()> {
        let mut map = self.entries.write();
        map.extend(entries);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    /// Refuses to remove one key
    struct StickyStore {
        inner: MemoryStore,
        sticky: &'static str,
    }

    #[async_trait]
    impl KeyValueStore for StickyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            if key == self.sticky {
                return Err(Error::Storage(format!("{key} is locked")));
            }
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.set("a", "1".to_string()).await.unwrap();
        store
            .multi_set(vec![("b".to_string(), "2".to_string())])
            .await
            .unwrap();

        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            store
                .multi_get(&["b".to_string(), "c".to_string()])
                .await
                .unwrap(),
            vec![Some("2".to_string()), None]
        );

        store
            .multi_remove(&["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(!store.contains("a"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_remove_attempts_every_key() {
        let store = StickyStore {
            inner: MemoryStore::new(),
            sticky: "b",
        };
        for key in ["a", "b", "c"] {
            store.set(key, "v".to_string()).await.unwrap();
        }

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
        let err = store.multi_remove(&keys).await.unwrap_err();

        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(store.inner.keys(), vec!["b".to_string()]);
    }
}
