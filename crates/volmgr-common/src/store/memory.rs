//! In-process store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{KvStore, StoreResult};

/// Store backed by a mutex-guarded map.
///
/// Every operation is a single critical section, so the store is
/// linearizable. Several orchestrator instances sharing one `Arc<MemoryStore>`
/// behave like instances sharing one replicated store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no keys are held.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns a copy of every key with the given prefix.
    pub fn snapshot(&self, prefix: &str) -> HashMap<String, String> {
        self.entries
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(store.conditional_put("k", "1", None).await.unwrap());
        assert!(!store.conditional_put("k", "2", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.conditional_put("k", "1", None).await.unwrap();

        assert!(!store.conditional_put("k", "3", Some("2")).await.unwrap());
        assert!(store.conditional_put("k", "2", Some("1")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_expected_value_on_missing_key() {
        let store = MemoryStore::new();
        assert!(!store.conditional_put("k", "2", Some("1")).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("missing").await.unwrap();
        store.conditional_put("k", "v", None).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_filters_prefix() {
        let store = MemoryStore::new();
        store.conditional_put("/a/1", "x", None).await.unwrap();
        store.conditional_put("/b/1", "y", None).await.unwrap();
        let snap = store.snapshot("/a/");
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("/a/1").map(String::as_str), Some("x"));
    }
}
