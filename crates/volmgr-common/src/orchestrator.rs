//! Publish/unpublish orchestration.
//!
//! Publish:
//!
//! 1. Reuse the volume's binding, or allocate a serial and bind it. Losing
//!    the bind race to another instance is not an error: the winner's serial
//!    is used.
//! 2. Attach the backend drive. Failure here leaves nothing attached.
//! 3. Attach the guest device. On a rejection the backend drive is detached
//!    again before the error is returned. When the attach went unanswered
//!    the device may exist, so it is detached as well. If the rollback fails
//!    the host is left with a dangling attachment and the result is
//!    [`VolumeError::PublishFailedDirty`].
//!
//! Unpublish detaches the device and then always detaches the backend drive,
//! since a half-finished publish may have left only the drive behind. It
//! fails only if both detaches fail. A detach the hypervisor rejects because
//! the target is already gone counts as done.
//!
//! Both run on a spawned task. A caller that goes away mid-flight detaches
//! from the task rather than aborting it, so compensation always completes.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::allocator::SerialAllocator;
use crate::binding::BindingStore;
use crate::channel::commands::{
    build_attach_backend_cmd, build_attach_device_cmd, build_detach_backend_cmd,
    build_detach_device_cmd,
};
use crate::channel::{self, ControlChannel, DEFAULT_COMMAND_TIMEOUT};
use crate::error::{VolumeError, VolumeResult};
use crate::image::ImageManager;
use crate::resolver::resolve_path;
use crate::store::{KvStore, StoreKeys, DEFAULT_STORE_TIMEOUT};
use crate::types::{HostId, Serial, VolumeName};

struct Inner {
    allocator: SerialAllocator<dyn KvStore>,
    bindings: BindingStore<dyn KvStore>,
    channel: Arc<dyn ControlChannel>,
    images: ImageManager,
    command_timeout: Duration,
}

/// Attaches and detaches volumes on VM hosts.
///
/// Cheap to clone; clones share the same store, channel and image manager.
#[derive(Clone)]
pub struct VolumeOrchestrator {
    inner: Arc<Inner>,
}

/// Store layout and timeouts used by a [`VolumeOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Key layout in the replicated store
    pub keys: StoreKeys,
    /// Bound on each store round-trip and on a whole serial allocation
    pub store_timeout: Duration,
    /// Bound on each control-channel command
    pub command_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            keys: StoreKeys::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl VolumeOrchestrator {
    /// Creates an orchestrator with the default store layout and timeouts.
    pub fn new(
        store: Arc<dyn KvStore>,
        channel: Arc<dyn ControlChannel>,
        images: ImageManager,
    ) -> Self {
        Self::with_settings(store, channel, images, OrchestratorSettings::default())
    }

    /// Creates an orchestrator with explicit settings.
    pub fn with_settings(
        store: Arc<dyn KvStore>,
        channel: Arc<dyn ControlChannel>,
        images: ImageManager,
        settings: OrchestratorSettings,
    ) -> Self {
        let OrchestratorSettings {
            keys,
            store_timeout,
            command_timeout,
        } = settings;
        Self {
            inner: Arc::new(Inner {
                allocator: SerialAllocator::with_keys(Arc::clone(&store), keys.clone(), store_timeout),
                bindings: BindingStore::with_keys(store, keys, store_timeout),
                channel,
                images,
                command_timeout,
            }),
        }
    }

    /// Returns the image manager backing this orchestrator.
    pub fn images(&self) -> &ImageManager {
        &self.inner.images
    }

    /// Attaches `volume` to `host`, returning the volume's serial.
    #[instrument(skip(self), fields(volume = %volume, host = %host))]
    pub async fn publish(&self, volume: &VolumeName, host: &HostId) -> VolumeResult<Serial> {
        let inner = Arc::clone(&self.inner);
        let (volume, host) = (volume.clone(), host.clone());
        let task = tokio::spawn(
            async move { inner.publish(&volume, &host).await }.in_current_span(),
        );
        task.await
            .map_err(|e| VolumeError::internal(format!("publish task failed: {}", e)))?
    }

    /// Detaches `volume` from `host`. The binding is kept.
    #[instrument(skip(self), fields(volume = %volume, host = %host))]
    pub async fn unpublish(&self, volume: &VolumeName, host: &HostId) -> VolumeResult<()> {
        let inner = Arc::clone(&self.inner);
        let (volume, host) = (volume.clone(), host.clone());
        let task = tokio::spawn(
            async move { inner.unpublish(&volume, &host).await }.in_current_span(),
        );
        task.await
            .map_err(|e| VolumeError::internal(format!("unpublish task failed: {}", e)))?
    }

    /// Returns the guest device path of a published volume.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn device_path(&self, volume: &VolumeName) -> VolumeResult<String> {
        match self.inner.bindings.get_serial(volume).await? {
            Some(serial) => Ok(resolve_path(serial)),
            None => {
                debug!("Volume has no binding yet");
                Err(VolumeError::not_found(volume.as_str()))
            }
        }
    }

    /// Returns the bound serial, if any.
    pub async fn serial(&self, volume: &VolumeName) -> VolumeResult<Option<Serial>> {
        self.inner.bindings.get_serial(volume).await
    }

    /// Drops the volume's binding. Used when the volume itself is deleted.
    #[instrument(skip(self), fields(volume = %volume))]
    pub async fn forget(&self, volume: &VolumeName) -> VolumeResult<()> {
        self.inner.bindings.delete_binding(volume).await?;
        info!("Forgot volume binding");
        Ok(())
    }
}

impl Inner {
    async fn send(&self, host: &HostId, command: &str) -> VolumeResult<String> {
        channel::bounded(
            host,
            self.command_timeout,
            self.channel.send_command(host, command),
        )
        .await
    }

    async fn ensure_binding(&self, volume: &VolumeName) -> VolumeResult<Serial> {
        if let Some(serial) = self.bindings.get_serial(volume).await? {
            debug!(serial = %serial, "Reusing existing binding");
            return Ok(serial);
        }

        let candidate = self.allocator.next_serial().await?;
        match self.bindings.bind_serial(volume, candidate).await {
            Ok(()) => {
                info!(serial = %candidate, "Bound new serial");
                Ok(candidate)
            }
            Err(VolumeError::AlreadyBound { serial, .. }) => {
                debug!(
                    candidate = %candidate,
                    winner = %serial,
                    "Lost bind race, using existing binding"
                );
                serial.parse().map_err(|_| {
                    VolumeError::store(
                        "get",
                        format!("binding for '{}' removed during publish", volume),
                    )
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, volume: &VolumeName, host: &HostId) -> VolumeResult<Serial> {
        let serial = self.ensure_binding(volume).await?;

        let attach_backend = build_attach_backend_cmd(&self.images.image_path(volume), volume);
        if let Err(e) = self.send(host, &attach_backend).await {
            warn!(error = %e, "Backend attach failed");
            return Err(VolumeError::PublishFailed {
                volume: volume.to_string(),
                host: host.to_string(),
                source: Box::new(e),
            });
        }

        let attach_device = build_attach_device_cmd(volume, serial);
        if let Err(attach_error) = self.send(host, &attach_device).await {
            warn!(error = %attach_error, "Device attach failed, rolling back");
            return match self.roll_back_attach(volume, host, &attach_error).await {
                Ok(()) => Err(VolumeError::PublishFailed {
                    volume: volume.to_string(),
                    host: host.to_string(),
                    source: Box::new(attach_error),
                }),
                Err(cleanup_error) => {
                    let err = VolumeError::PublishFailedDirty {
                        volume: volume.to_string(),
                        host: host.to_string(),
                        attach_error: Box::new(attach_error),
                        source: Box::new(cleanup_error),
                    };
                    error!(error = %err, "Rollback failed, volume left attached, operator action required");
                    Err(err)
                }
            };
        }

        info!(serial = %serial, "Published volume");
        Ok(serial)
    }

    /// Undoes a failed device attach.
    ///
    /// A rejected attach left no device, so only the backend drive goes. An
    /// unanswered one may have been applied, so the device is detached too;
    /// a detach that finds nothing to remove counts as done.
    async fn roll_back_attach(
        &self,
        volume: &VolumeName,
        host: &HostId,
        attach_error: &VolumeError,
    ) -> VolumeResult<()> {
        match attach_error {
            VolumeError::CommandRejected { .. } => {
                self.send(host, &build_detach_backend_cmd(volume)).await?;
            }
            _ => {
                self.send(host, &build_detach_device_cmd(volume))
                    .await
                    .or_else(already_detached)?;
                self.send(host, &build_detach_backend_cmd(volume))
                    .await
                    .or_else(already_detached)?;
            }
        }
        Ok(())
    }

    async fn unpublish(&self, volume: &VolumeName, host: &HostId) -> VolumeResult<()> {
        let device = self
            .send(host, &build_detach_device_cmd(volume))
            .await
            .or_else(already_detached);
        if let Err(e) = &device {
            warn!(error = %e, "Device detach failed, still detaching backend");
        }

        let backend = self
            .send(host, &build_detach_backend_cmd(volume))
            .await
            .or_else(already_detached);

        match (device, backend) {
            (Err(device_error), Err(backend_error)) => Err(VolumeError::UnpublishFailed {
                volume: volume.to_string(),
                host: host.to_string(),
                device_error: Box::new(device_error),
                source: Box::new(backend_error),
            }),
            (_, backend) => {
                if let Err(e) = backend {
                    warn!(error = %e, "Backend detach failed after device detach");
                }
                info!("Unpublished volume");
                Ok(())
            }
        }
    }
}

/// Treats a rejection for a missing device or drive as a completed detach.
fn already_detached(err: VolumeError) -> VolumeResult<String> {
    match &err {
        VolumeError::CommandRejected { detail, .. }
            if detail.to_ascii_lowercase().contains("not found") =>
        {
            debug!(detail = %detail, "Already detached");
            Ok(String::new())
        }
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::CapacityLimits;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records commands; rejects any command starting with one of `reject`
    /// and leaves any starting with one of `silent` unanswered.
    #[derive(Default)]
    struct ScriptedChannel {
        sent: Mutex<Vec<String>>,
        reject: Mutex<Vec<&'static str>>,
        silent: Mutex<Vec<&'static str>>,
    }

    impl ScriptedChannel {
        fn rejecting(prefixes: &[&'static str]) -> Self {
            let channel = Self::default();
            channel.reject.lock().extend_from_slice(prefixes);
            channel
        }

        fn silent_on(self, prefixes: &[&'static str]) -> Self {
            self.silent.lock().extend_from_slice(prefixes);
            self
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ControlChannel for ScriptedChannel {
        async fn send_command(&self, host: &HostId, command: &str) -> VolumeResult<String> {
            self.sent.lock().push(format!("{} {}", host, command));
            if self.reject.lock().iter().any(|p| command.starts_with(p)) {
                return Err(VolumeError::rejected(host.as_str(), command, "refused"));
            }
            if self.silent.lock().iter().any(|p| command.starts_with(p)) {
                return Err(VolumeError::unreachable(host.as_str(), "no answer"));
            }
            Ok(String::new())
        }
    }

    fn orchestrator(channel: Arc<ScriptedChannel>) -> (VolumeOrchestrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let orch = VolumeOrchestrator::new(
            store.clone(),
            channel,
            ImageManager::new("/fs/trust/vm/csi", CapacityLimits::default()),
        );
        (orch, store)
    }

    fn vol(name: &str) -> VolumeName {
        VolumeName::new(name).unwrap()
    }

    fn host(name: &str) -> HostId {
        HostId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_publish_first_time() {
        let channel = Arc::new(ScriptedChannel::default());
        let (orch, _store) = orchestrator(channel.clone());

        let serial = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap();
        assert_eq!(serial, Serial::new(1));
        assert_eq!(
            channel.sent(),
            vec![
                "host-1 drive_add 0 if=none,format=qcow2,file=/fs/trust/vm/csi/vol-a.qcow2,id=vol-a",
                "host-1 device_add virtio-blk-pci,drive=vol-a,id=vol-a,serial=1",
            ]
        );
        assert_eq!(
            orch.device_path(&vol("vol-a")).await.unwrap(),
            "/dev/disk/by-id/virtio-1"
        );
    }

    #[tokio::test]
    async fn test_backend_failure_no_compensation() {
        let channel = Arc::new(ScriptedChannel::rejecting(&["drive_add"]));
        let (orch, _store) = orchestrator(channel.clone());

        let err = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap_err();
        assert!(matches!(err, VolumeError::PublishFailed { .. }));
        assert_eq!(channel.sent().len(), 1);
        // The binding survives a failed attach.
        assert_eq!(orch.serial(&vol("vol-a")).await.unwrap(), Some(Serial::new(1)));
    }

    #[tokio::test]
    async fn test_device_failure_compensates() {
        let channel = Arc::new(ScriptedChannel::rejecting(&["device_add"]));
        let (orch, _store) = orchestrator(channel.clone());

        let err = orch.publish(&vol("vol-b"), &host("host-2")).await.unwrap_err();
        match &err {
            VolumeError::PublishFailed { source, .. } => {
                assert!(matches!(**source, VolumeError::CommandRejected { .. }))
            }
            other => panic!("expected PublishFailed, got {:?}", other),
        }
        assert_eq!(channel.sent().last().unwrap(), "host-2 drive_del vol-b");
    }

    #[tokio::test]
    async fn test_double_failure_is_dirty() {
        let channel = Arc::new(ScriptedChannel::rejecting(&["device_add", "drive_del"]));
        let (orch, _store) = orchestrator(channel.clone());

        let err = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap_err();
        assert!(err.requires_operator());
        assert!(!err.is_retryable());
        assert_eq!(channel.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_unpublish_tolerates_device_failure() {
        let channel = Arc::new(ScriptedChannel::rejecting(&["device_del"]));
        let (orch, _store) = orchestrator(channel.clone());

        orch.unpublish(&vol("vol-a"), &host("host-1")).await.unwrap();
        assert_eq!(
            channel.sent(),
            vec!["host-1 device_del vol-a", "host-1 drive_del vol-a"]
        );
    }

    #[tokio::test]
    async fn test_unpublish_both_fail() {
        let channel = Arc::new(ScriptedChannel::rejecting(&["device_del", "drive_del"]));
        let (orch, _store) = orchestrator(channel);

        assert!(matches!(
            orch.unpublish(&vol("vol-a"), &host("host-1")).await,
            Err(VolumeError::UnpublishFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unpublish_keeps_binding() {
        let channel = Arc::new(ScriptedChannel::default());
        let (orch, _store) = orchestrator(channel);

        orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap();
        orch.unpublish(&vol("vol-a"), &host("host-1")).await.unwrap();
        assert_eq!(orch.serial(&vol("vol-a")).await.unwrap(), Some(Serial::new(1)));
    }

    #[tokio::test]
    async fn test_device_path_not_found() {
        let (orch, _store) = orchestrator(Arc::new(ScriptedChannel::default()));
        assert!(matches!(
            orch.device_path(&vol("vol-z")).await,
            Err(VolumeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_forget() {
        let (orch, store) = orchestrator(Arc::new(ScriptedChannel::default()));
        orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap();
        orch.forget(&vol("vol-a")).await.unwrap();

        assert_eq!(orch.serial(&vol("vol-a")).await.unwrap(), None);
        // Counter is untouched; the next volume still gets a fresh serial.
        assert_eq!(store.get("/volmgr/serial").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_unanswered_device_attach_detaches_both() {
        let channel = Arc::new(ScriptedChannel::default().silent_on(&["device_add"]));
        let (orch, _store) = orchestrator(channel.clone());

        let err = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap_err();
        match &err {
            VolumeError::PublishFailed { source, .. } => {
                assert!(matches!(**source, VolumeError::ChannelUnreachable { .. }))
            }
            other => panic!("expected PublishFailed, got {:?}", other),
        }
        assert!(err.is_retryable());
        assert_eq!(
            &channel.sent()[2..],
            &["host-1 device_del vol-a", "host-1 drive_del vol-a"]
        );
    }

    #[tokio::test]
    async fn test_unanswered_device_attach_with_failed_rollback_is_dirty() {
        let channel = Arc::new(
            ScriptedChannel::rejecting(&["device_del"]).silent_on(&["device_add"]),
        );
        let (orch, _store) = orchestrator(channel.clone());

        let err = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap_err();
        assert!(matches!(err, VolumeError::PublishFailedDirty { .. }));
        assert!(err.requires_operator());
        // The drive cannot go while the device may still hold it
        assert_eq!(channel.sent().last().unwrap(), "host-1 device_del vol-a");
    }

    #[tokio::test]
    async fn test_unpublish_backend_failure_still_succeeds() {
        let channel = Arc::new(ScriptedChannel::default().silent_on(&["drive_del"]));
        let (orch, _store) = orchestrator(channel.clone());

        orch.unpublish(&vol("vol-a"), &host("host-1")).await.unwrap();
        assert_eq!(channel.sent().len(), 2);
    }

    /// Hides the binding from the first read of it, as if a rival instance
    /// bound the volume right after that read.
    struct RacingStore {
        inner: MemoryStore,
        hidden_reads: Mutex<u32>,
        binding_reads: Mutex<u32>,
    }

    impl RacingStore {
        async fn new(rival_serial: Option<&str>) -> Self {
            let inner = MemoryStore::new();
            if let Some(serial) = rival_serial {
                inner
                    .conditional_put("/volmgr/bindings/vol-a", serial, None)
                    .await
                    .unwrap();
            }
            Self {
                inner,
                hidden_reads: Mutex::new(1),
                binding_reads: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl KvStore for RacingStore {
        async fn get(&self, key: &str) -> crate::store::StoreResult<Option<String>> {
            if key.contains("/bindings/") {
                *self.binding_reads.lock() += 1;
                let mut hidden = self.hidden_reads.lock();
                if *hidden > 0 {
                    *hidden -= 1;
                    return Ok(None);
                }
            }
            self.inner.get(key).await
        }

        async fn conditional_put(
            &self,
            key: &str,
            value: &str,
            expected: Option<&str>,
        ) -> crate::store::StoreResult<bool> {
            if key.contains("/bindings/") && expected.is_none() {
                // The rival's write always lands first
                return Ok(false);
            }
            self.inner.conditional_put(key, value, expected).await
        }

        async fn delete(&self, key: &str) -> crate::store::StoreResult<()> {
            self.inner.delete(key).await
        }
    }

    fn racing_orchestrator(store: Arc<RacingStore>) -> VolumeOrchestrator {
        VolumeOrchestrator::new(
            store,
            Arc::new(ScriptedChannel::default()),
            ImageManager::new("/fs/trust/vm/csi", CapacityLimits::default()),
        )
    }

    #[tokio::test]
    async fn test_lost_bind_race_uses_winner_serial() {
        let store = Arc::new(RacingStore::new(Some("5")).await);
        let orch = racing_orchestrator(Arc::clone(&store));

        let serial = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap();
        assert_eq!(serial, Serial::new(5));
        // One read before allocating, one inside the failed bind
        assert_eq!(*store.binding_reads.lock(), 2);
    }

    #[tokio::test]
    async fn test_binding_removed_during_publish_is_retryable() {
        let store = Arc::new(RacingStore::new(None).await);
        let orch = racing_orchestrator(store);

        let err = orch.publish(&vol("vol-a"), &host("host-1")).await.unwrap_err();
        assert!(matches!(err, VolumeError::Store { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_already_detached() {
        let gone = VolumeError::rejected("host-1", "device_del vol-a", "Device 'vol-a' not found");
        assert!(already_detached(gone).is_ok());

        let busy = VolumeError::rejected("host-1", "drive_del vol-a", "Device is in use");
        assert!(already_detached(busy).is_err());

        let lost = VolumeError::unreachable("host-1", "timed out");
        assert!(already_detached(lost).is_err());
    }
}
