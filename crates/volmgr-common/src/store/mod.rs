//! Replicated key-value store abstraction.
//!
//! The allocator and the binding store coordinate independent orchestrator
//! instances through exactly two primitives of a linearizable store: a read
//! and a conditional write. Nothing is locked in-process.
//!
//! - [`MemoryStore`]: single-process store, shared through `Arc` it stands in
//!   for one replicated store seen by several instances
//! - [`RedisStore`]: Redis backend, conditional writes run as a Lua script

mod memory;
mod redis_backend;

pub use self::memory::MemoryStore;
pub use self::redis_backend::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default key prefix for everything this crate stores.
pub const DEFAULT_KEY_PREFIX: &str = "/volmgr/";

/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors from store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Minimal linearizable key-value interface.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a key.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value` only if the current value equals `expected`
    /// (`None` = key must be absent). Returns false when the condition did
    /// not hold and nothing was written.
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
    ) -> StoreResult<bool>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Runs a store call under a timeout, folding expiry into [`StoreError::Timeout`].
pub async fn bounded<T, F>(timeout: Duration, op: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Key layout shared by the allocator and the binding store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Creates a key layout under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the global serial counter.
    pub fn counter(&self) -> String {
        format!("{}serial", self.prefix)
    }

    /// Key holding the binding for one volume.
    pub fn binding(&self, volume: &str) -> String {
        format!("{}bindings/{}", self.prefix, volume)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
