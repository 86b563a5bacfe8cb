//! Test fixtures for orchestration scenarios
//!
//! A [`Cluster`] is several orchestrator instances sharing one store and one
//! fake hypervisor fleet, the way independent host agents share etcd/Redis
//! and the VMs they drive.

use std::sync::Arc;
use volmgr_common::{
    CapacityLimits, HostId, ImageManager, KvStore, MemoryStore, VolumeName, VolumeOrchestrator,
};

use crate::FakeHypervisor;

/// Disk root used by fixture image managers
pub const TEST_DISK_ROOT: &str = "/fs/trust/vm/csi";

/// Builds a volume name, panicking on invalid input
pub fn volume(name: &str) -> VolumeName {
    VolumeName::new(name).expect("invalid fixture volume name")
}

/// Builds a host id, panicking on invalid input
pub fn host(name: &str) -> HostId {
    HostId::new(name).expect("invalid fixture host id")
}

/// Image manager rooted at [`TEST_DISK_ROOT`]
pub fn test_images() -> ImageManager {
    ImageManager::new(TEST_DISK_ROOT, CapacityLimits::default())
}

/// Orchestrator instances over shared collaborators
pub struct Cluster {
    pub store: Arc<dyn KvStore>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub instances: Vec<VolumeOrchestrator>,
}

impl Cluster {
    /// `n` instances over a fresh in-memory store
    pub fn in_memory(n: usize) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), n)
    }

    /// `n` instances over `store`
    pub fn with_store(store: Arc<dyn KvStore>, n: usize) -> Self {
        let hypervisor = Arc::new(FakeHypervisor::new());
        let instances = (0..n)
            .map(|_| {
                VolumeOrchestrator::new(Arc::clone(&store), hypervisor.clone(), test_images())
            })
            .collect();
        Self {
            store,
            hypervisor,
            instances,
        }
    }

    /// The first instance
    pub fn orchestrator(&self) -> &VolumeOrchestrator {
        &self.instances[0]
    }
}

/// Expected monitor commands for one volume
pub mod commands {
    use super::TEST_DISK_ROOT;

    pub fn attach_backend(volume: &str) -> String {
        format!(
            "drive_add 0 if=none,format=qcow2,file={}/{}.qcow2,id={}",
            TEST_DISK_ROOT, volume, volume
        )
    }

    pub fn attach_device(volume: &str, serial: u64) -> String {
        format!(
            "device_add virtio-blk-pci,drive={},id={},serial={}",
            volume, volume, serial
        )
    }

    pub fn detach_device(volume: &str) -> String {
        format!("device_del {}", volume)
    }

    pub fn detach_backend(volume: &str) -> String {
        format!("drive_del {}", volume)
    }
}
