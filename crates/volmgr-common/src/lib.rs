//! Volume publish/unpublish orchestration for QEMU guests.
//!
//! A volume is a qcow2 image on the host. Publishing it to a VM attaches the
//! image as a backend drive and exposes the drive to the guest as a
//! virtio-blk device whose serial is unique for the life of the system, so
//! the guest finds it at a stable `/dev/disk/by-id/virtio-<serial>` path.
//!
//! - [`allocator`]: serial allocation as a compare-and-swap loop on the store
//! - [`binding`]: write-once volume → serial bindings
//! - [`channel`]: hypervisor control channel and its QMP transport
//! - [`orchestrator`]: publish/unpublish with compensation
//! - [`resolver`]: serial → guest device path
//! - [`image`]: qcow2 image lifecycle
//! - [`store`]: replicated key-value store backends
//! - [`shell`]: shell command execution with quoting
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use volmgr_common::{
//!     CapacityLimits, HostId, ImageManager, MemoryStore, QmpChannel, QmpChannelConfig,
//!     VolumeName, VolumeOrchestrator,
//! };
//!
//! let orch = VolumeOrchestrator::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(QmpChannel::new(QmpChannelConfig::new("/run/volmgr/qmp"))),
//!     ImageManager::new("/fs/trust/vm/csi", CapacityLimits::default()),
//! );
//! let serial = orch.publish(&VolumeName::new("vol-a")?, &HostId::new("host-1")?).await?;
//! ```

pub mod allocator;
pub mod binding;
pub mod channel;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod resolver;
pub mod shell;
pub mod store;
pub mod types;

pub use allocator::SerialAllocator;
pub use binding::BindingStore;
pub use channel::{ControlChannel, QmpChannel, QmpChannelConfig};
pub use error::{VolumeError, VolumeResult};
pub use image::{CapacityLimits, ImageManager};
pub use orchestrator::{OrchestratorSettings, VolumeOrchestrator};
pub use resolver::resolve_path;
pub use store::{KvStore, MemoryStore, RedisStore, RedisStoreConfig, StoreKeys};
pub use types::{HostId, Serial, VolumeName};
