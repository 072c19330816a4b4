//! Host-side device preparation.
//!
//! Every operation is atomic from the coordinator's point of view: it either
//! returns a usable resource handle or an error with no state left behind.

pub mod network;
pub mod share;
pub mod storage;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

pub use network::{NetworkPool, TapDevice};
pub use storage::{BlockDevice, DeviceMetadata, DmPool, RestoreMode};

pub use crate::error::DeviceError;

/// The device operations the VM coordinator consumes. A trait seam so tests
/// can drive the coordinator without root or device-mapper.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Thin-snapshot block device carrying a container's image.
    async fn image_device(&self, container_id: &str, image: &str)
    -> Result<BlockDevice, DeviceError>;

    /// Fresh thin block device for a pod volume.
    async fn volume_device(&self, name: &str) -> Result<BlockDevice, DeviceError>;

    /// Delete a device created by either of the above.
    async fn remove_device(&self, id: &str) -> Result<(), DeviceError>;

    /// Tap interface attached to the pod bridge.
    async fn allocate_tap(&self, requested: Option<Ipv4Addr>) -> Result<TapDevice, DeviceError>;

    /// Return a tap's address to the allocator after its fd is closed.
    fn release_address(&self, ip: Ipv4Addr);

    /// Mount the per-VM shared directory and return its path.
    async fn setup_share(&self, vm_root: &Path) -> Result<PathBuf, DeviceError>;

    /// Unmount and remove the shared directory. Best-effort.
    async fn teardown_share(&self, share_dir: &Path);
}

/// Production provisioner: device-mapper thin pool plus the bridge allocator.
pub struct HostProvisioner {
    pub storage: Arc<DmPool>,
    pub network: Arc<NetworkPool>,
}

#[async_trait]
impl Provisioner for HostProvisioner {
    async fn image_device(
        &self,
        container_id: &str,
        image: &str,
    ) -> Result<BlockDevice, DeviceError> {
        self.storage.create_image_device(container_id, image).await
    }

    async fn volume_device(&self, name: &str) -> Result<BlockDevice, DeviceError> {
        self.storage.create_volume(name).await
    }

    async fn remove_device(&self, id: &str) -> Result<(), DeviceError> {
        self.storage.delete_device(id).await
    }

    async fn allocate_tap(&self, requested: Option<Ipv4Addr>) -> Result<TapDevice, DeviceError> {
        self.network.allocate_tap(requested).await
    }

    fn release_address(&self, ip: Ipv4Addr) {
        self.network.release_ip(ip);
    }

    async fn setup_share(&self, vm_root: &Path) -> Result<PathBuf, DeviceError> {
        share::setup_share_dir(vm_root).await
    }

    async fn teardown_share(&self, share_dir: &Path) {
        share::teardown_share_dir(share_dir).await;
    }
}
