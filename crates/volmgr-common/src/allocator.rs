//! Durable serial allocator.
//!
//! Serials come from one counter key in the replicated store. Allocation is
//! an optimistic compare-and-swap loop, so two instances that read the same
//! counter value can never both commit the same successor: the loser's
//! conditional write fails and it re-reads.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{VolumeError, VolumeResult};
use crate::store::{bounded, KvStore, StoreError, StoreKeys, DEFAULT_STORE_TIMEOUT};
use crate::types::Serial;

/// Hands out globally unique serials.
pub struct SerialAllocator<S: ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
    timeout: Duration,
}

impl<S: ?Sized> Clone for SerialAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: KvStore + ?Sized> SerialAllocator<S> {
    /// Creates an allocator with the default key layout and timeout.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_keys(store, StoreKeys::default(), DEFAULT_STORE_TIMEOUT)
    }

    /// Creates an allocator with an explicit key layout and timeout.
    ///
    /// `timeout` bounds each store call and the whole allocation, retries
    /// included.
    pub fn with_keys(store: Arc<S>, keys: StoreKeys, timeout: Duration) -> Self {
        Self {
            store,
            keys,
            timeout,
        }
    }

    /// Allocates the next serial.
    ///
    /// The first allocation ever (no counter key) writes and returns
    /// [`Serial::FIRST`]; every later one writes and returns the successor of
    /// the value it read.
    #[instrument(skip(self))]
    pub async fn next_serial(&self) -> VolumeResult<Serial> {
        let key = self.keys.counter();
        let serial = bounded(self.timeout, self.cas_loop(&key))
            .await
            .map_err(|e| match e {
                StoreError::Timeout(t) => VolumeError::allocation_unavailable(format!(
                    "allocation did not complete within {:?}",
                    t
                )),
                other => VolumeError::allocation_unavailable(other.to_string()),
            })?;
        Ok(serial)
    }

    async fn cas_loop(&self, key: &str) -> Result<Serial, StoreError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let current = bounded(self.timeout, self.store.get(key)).await?;

            let (next, expected) = match current.as_deref() {
                None => (Serial::FIRST, None),
                Some(raw) => {
                    let value: Serial = raw.parse().map_err(|_| {
                        StoreError::Command(format!("counter '{}' holds non-numeric '{}'", key, raw))
                    })?;
                    let next = value.successor().ok_or_else(|| {
                        StoreError::Command(format!("counter '{}' exhausted", key))
                    })?;
                    (next, Some(raw))
                }
            };

            let written = bounded(
                self.timeout,
                self.store.conditional_put(key, &next.to_string(), expected),
            )
            .await?;
            if written {
                debug!(serial = %next, attempts, "Allocated serial");
                return Ok(next);
            }

            if attempts % 16 == 0 {
                warn!(attempts, "Serial counter under heavy contention");
            }
            tokio::task::yield_now().await;
        }
    }
}
