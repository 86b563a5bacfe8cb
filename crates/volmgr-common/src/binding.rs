//! Durable volume → serial bindings.
//!
//! A binding is written with a conditional create and never overwritten, so
//! at most one serial is ever bound to a name even when first-time publishes
//! race across instances.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{VolumeError, VolumeResult};
use crate::store::{bounded, KvStore, StoreKeys, DEFAULT_STORE_TIMEOUT};
use crate::types::{Serial, VolumeName};

/// Reads and writes bindings in the replicated store.
pub struct BindingStore<S: ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
    timeout: Duration,
}

impl<S: ?Sized> Clone for BindingStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: KvStore + ?Sized> BindingStore<S> {
    /// Creates a binding store with the default key layout and timeout.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_keys(store, StoreKeys::default(), DEFAULT_STORE_TIMEOUT)
    }

    /// Creates a binding store with an explicit key layout and per-call timeout.
    pub fn with_keys(store: Arc<S>, keys: StoreKeys, timeout: Duration) -> Self {
        Self {
            store,
            keys,
            timeout,
        }
    }

    /// Returns the bound serial, or `None` if the volume was never published.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn get_serial(&self, volume: &VolumeName) -> VolumeResult<Option<Serial>> {
        let key = self.keys.binding(volume.as_str());
        let raw = bounded(self.timeout, self.store.get(&key))
            .await
            .map_err(|e| VolumeError::store("get", e.to_string()))?;

        match raw {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                VolumeError::store("get", format!("binding '{}' holds non-numeric '{}'", key, raw))
            }),
        }
    }

    /// Binds `serial` to `volume` unless a binding already exists.
    ///
    /// Fails with [`VolumeError::AlreadyBound`] carrying the existing serial
    /// when another writer got there first.
    #[instrument(skip(self), fields(volume = %volume, serial = %serial))]
    pub async fn bind_serial(&self, volume: &VolumeName, serial: Serial) -> VolumeResult<()> {
        let key = self.keys.binding(volume.as_str());
        let created = bounded(
            self.timeout,
            self.store.conditional_put(&key, &serial.to_string(), None),
        )
        .await
        .map_err(|e| VolumeError::store("conditional_put", e.to_string()))?;

        if created {
            debug!("Bound serial");
            return Ok(());
        }

        let existing = self
            .get_serial(volume)
            .await?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<deleted>".to_string());
        Err(VolumeError::AlreadyBound {
            volume: volume.to_string(),
            serial: existing,
        })
    }

    /// Removes the binding. A missing binding is not an error.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn delete_binding(&self, volume: &VolumeName) -> VolumeResult<()> {
        let key = self.keys.binding(volume.as_str());
        bounded(self.timeout, self.store.delete(&key))
            .await
            .map_err(|e| VolumeError::store("delete", e.to_string()))?;
        debug!("Deleted binding");
        Ok(())
    }
}
