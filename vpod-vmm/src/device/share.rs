//! The per-VM shared directory, exported to the guest over virtio-9p.
//!
//! A tmpfs mount keeps rendered descriptors and injected files off the
//! host's disk and makes teardown a single unmount.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, warn};

use crate::error::DeviceError;

pub const SHARE_DIR_TAG: &str = "share_dir";

pub async fn setup_share_dir(vm_root: &Path) -> Result<PathBuf, DeviceError> {
    let share = vm_root.join(SHARE_DIR_TAG);
    tokio::fs::create_dir_all(&share).await?;
    mount(
        Some("tmpfs"),
        &share,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=64m,mode=0755"),
    )
    .map_err(|e| DeviceError::Mount {
        target: share.display().to_string(),
        source: e,
    })?;
    debug!(dir = %share.display(), "share dir mounted");
    Ok(share)
}

pub async fn teardown_share_dir(share: &Path) {
    if let Err(e) = umount2(share, MntFlags::MNT_DETACH) {
        warn!(dir = %share.display(), error = %e, "share dir unmount failed");
    }
    if let Err(e) = tokio::fs::remove_dir_all(share).await {
        warn!(dir = %share.display(), error = %e, "share dir removal failed");
    }
}
