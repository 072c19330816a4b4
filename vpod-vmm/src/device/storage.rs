//! Thin-provisioned block devices on a device-mapper pool.
//!
//! Container images become copy-on-write snapshots of their parent image
//! device; volumes are fresh thin devices with an ext4 filesystem. Device
//! metadata (id, size, transaction id) is written atomically next to the
//! pool so a peer daemon can recreate the same device from a migration
//! envelope by replaying it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::DeviceError;

/// Metadata persisted per device, replayed on migration restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: u32,
    pub device_size: u64,
    pub transaction_id: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TransactionRecord {
    open_transaction_id: u64,
    next_device_id: u32,
}

/// How a device is rebuilt on a migration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Zero-copy external snapshot of the origin device.
    Snapshot,
    /// mkfs a fresh thin device and copy the origin's contents through a
    /// mounted pair.
    Copy,
}

/// A created block device and everything needed to present or recreate it.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// Logical name: the container id or volume name.
    pub name: String,
    pub path: PathBuf,
    pub format: String,
    pub fstype: String,
    pub metadata: DeviceMetadata,
}

/// Handle on the daemon's thin pool.
pub struct DmPool {
    pool_name: String,
    dev_prefix: String,
    root: PathBuf,
    device_size: u64,
}

impl DmPool {
    pub fn new(root: &Path, pool_name: &str, dev_prefix: &str, device_size: u64) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            dev_prefix: dev_prefix.to_string(),
            root: root.to_path_buf(),
            device_size,
        }
    }

    fn pool_path(&self) -> String {
        format!("/dev/mapper/{}", self.pool_name)
    }

    fn device_name(&self, id: &str) -> String {
        format!("{}-{}", self.dev_prefix, id)
    }

    fn device_path(&self, id: &str) -> PathBuf {
        PathBuf::from("/dev/mapper").join(self.device_name(id))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("devicemapper").join("metadata")
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.metadata_dir().join(id)
    }

    /// Backend path exported to migration peers.
    pub fn backend_path(&self) -> PathBuf {
        self.root.join("devicemapper")
    }

    /// Reserve the next device id under a fresh transaction, durably.
    async fn allocate_device_id(&self) -> Result<(u32, u64), DeviceError> {
        let dir = self.metadata_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("transaction-metadata");
        let mut record = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<TransactionRecord>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TransactionRecord::default(),
            Err(e) => return Err(e.into()),
        };
        record.open_transaction_id += 1;
        let device_id = record.next_device_id;
        record.next_device_id += 1;
        let transaction_id = record.open_transaction_id;
        write_atomically(&path, &serde_json::to_vec(&record)?).await?;
        Ok((device_id, transaction_id))
    }

    async fn write_metadata(&self, id: &str, meta: &DeviceMetadata) -> Result<(), DeviceError> {
        tokio::fs::create_dir_all(self.metadata_dir()).await?;
        write_atomically(&self.metadata_path(id), &serde_json::to_vec(meta)?).await
    }

    pub async fn read_metadata(&self, id: &str) -> Result<DeviceMetadata, DeviceError> {
        let bytes = tokio::fs::read(self.metadata_path(id))
            .await
            .map_err(|e| DeviceError::Metadata {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| DeviceError::Metadata {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Thin snapshot of the image device for one container. The image store
    /// keeps base image devices on the same pool under the same prefix, so
    /// the origin is addressable by image id.
    pub async fn create_image_device(
        &self,
        container_id: &str,
        image: &str,
    ) -> Result<BlockDevice, DeviceError> {
        let origin = self.device_name(image);
        let (device_id, transaction_id) = self.allocate_device_id().await?;
        let meta = DeviceMetadata {
            device_id,
            device_size: self.device_size,
            transaction_id,
        };
        self.write_metadata(container_id, &meta).await?;
        self.materialize(container_id, &meta, Some(&origin), RestoreMode::Snapshot)
            .await?;
        info!(container = container_id, image, device_id, "image device created");
        Ok(BlockDevice {
            name: container_id.to_string(),
            path: self.device_path(container_id),
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            metadata: meta,
        })
    }

    /// Fresh thin device with an ext4 filesystem for a pod volume.
    pub async fn create_volume(&self, name: &str) -> Result<BlockDevice, DeviceError> {
        let (device_id, transaction_id) = self.allocate_device_id().await?;
        let meta = DeviceMetadata {
            device_id,
            device_size: self.device_size,
            transaction_id,
        };
        self.write_metadata(name, &meta).await?;
        let dev_name = self.device_name(name);
        self.dmsetup_message(&format!("create_thin {device_id}"))
            .await?;
        if let Err(e) = self.dmsetup_create(&dev_name, &meta, None).await {
            let _ = self.dmsetup_message(&format!("delete {device_id}")).await;
            return Err(e);
        }
        let dev_path = self.device_path(name);
        if let Err(e) = run_tool("mkfs.ext4", &[&dev_path.to_string_lossy()]).await {
            let _ = self.delete_device(name).await;
            return Err(e);
        }
        info!(volume = name, device_id, "volume device created");
        Ok(BlockDevice {
            name: name.to_string(),
            path: dev_path,
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            metadata: meta,
        })
    }

    /// Recreate a device on a migration target from its replayed metadata.
    /// The origin is the parent image device on the local pool; volumes
    /// restore without one.
    pub async fn restore_device(
        &self,
        id: &str,
        origin: Option<&str>,
        mode: RestoreMode,
    ) -> Result<BlockDevice, DeviceError> {
        let meta = self.read_metadata(id).await?;
        let origin = origin.map(|o| self.device_name(o));
        self.materialize(id, &meta, origin.as_deref(), mode).await?;
        info!(device = id, ?mode, device_id = meta.device_id, "device restored");
        Ok(BlockDevice {
            name: id.to_string(),
            path: self.device_path(id),
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            metadata: meta,
        })
    }

    /// Activate a device in the pool: create the thin target, then either an
    /// external snapshot of the origin or a copied filesystem.
    async fn materialize(
        &self,
        id: &str,
        meta: &DeviceMetadata,
        origin: Option<&str>,
        mode: RestoreMode,
    ) -> Result<(), DeviceError> {
        let dev_name = self.device_name(id);
        self.dmsetup_message(&format!("create_thin {}", meta.device_id))
            .await?;
        let result = match (mode, origin) {
            (RestoreMode::Snapshot, Some(origin)) => {
                self.dmsetup_create(&dev_name, meta, Some(origin)).await
            }
            (RestoreMode::Snapshot, None) => self.dmsetup_create(&dev_name, meta, None).await,
            (RestoreMode::Copy, origin) => match self.dmsetup_create(&dev_name, meta, None).await {
                Ok(()) => self.copy_contents(&dev_name, origin).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            let _ = run_tool("dmsetup", &["remove", &dev_name]).await;
            let _ = self
                .dmsetup_message(&format!("delete {}", meta.device_id))
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn dmsetup_create(
        &self,
        dev_name: &str,
        meta: &DeviceMetadata,
        origin: Option<&str>,
    ) -> Result<(), DeviceError> {
        let sectors = meta.device_size / 512;
        let table = match origin {
            Some(origin) => format!(
                "0 {sectors} thin {} {} /dev/mapper/{origin}",
                self.pool_path(),
                meta.device_id
            ),
            None => format!("0 {sectors} thin {} {}", self.pool_path(), meta.device_id),
        };
        run_tool("dmsetup", &["create", dev_name, "--table", &table]).await?;
        Ok(())
    }

    async fn dmsetup_message(&self, message: &str) -> Result<(), DeviceError> {
        run_tool("dmsetup", &["message", &self.pool_path(), "0", message]).await?;
        Ok(())
    }

    /// The copied strategy: mkfs the new device, mount it next to the origin
    /// and copy the tree over.
    async fn copy_contents(&self, dev_name: &str, origin: Option<&str>) -> Result<(), DeviceError> {
        let dev_path = format!("/dev/mapper/{dev_name}");
        run_tool("mkfs.ext4", &[&dev_path]).await?;
        let Some(origin) = origin else {
            return Ok(());
        };
        let origin_path = format!("/dev/mapper/{origin}");
        let mounts = self.root.join("devicemapper").join("mnt");
        let src = mounts.join(format!("{dev_name}-src"));
        let dst = mounts.join(format!("{dev_name}-dst"));
        tokio::fs::create_dir_all(&src).await?;
        tokio::fs::create_dir_all(&dst).await?;

        run_tool("mount", &[&origin_path, &src.to_string_lossy()]).await?;
        let copied = async {
            run_tool("mount", &[&dev_path, &dst.to_string_lossy()]).await?;
            let result = run_tool(
                "cp",
                &[
                    "-a",
                    &format!("{}/.", src.to_string_lossy()),
                    &dst.to_string_lossy(),
                ],
            )
            .await;
            let _ = run_tool("umount", &[&dst.to_string_lossy()]).await;
            result.map(|_| ())
        }
        .await;
        let _ = run_tool("umount", &[&src.to_string_lossy()]).await;
        let _ = tokio::fs::remove_dir(&src).await;
        let _ = tokio::fs::remove_dir(&dst).await;
        copied
    }

    /// Remove a device and free its pool slot. The metadata file goes too.
    pub async fn delete_device(&self, id: &str) -> Result<(), DeviceError> {
        let dev_name = self.device_name(id);
        run_tool("dmsetup", &["remove", &dev_name]).await?;
        match self.read_metadata(id).await {
            Ok(meta) => {
                self.dmsetup_message(&format!("delete {}", meta.device_id))
                    .await?;
            }
            Err(e) => warn!(device = id, error = %e, "no metadata for deleted device"),
        }
        let _ = tokio::fs::remove_file(self.metadata_path(id)).await;
        debug!(device = id, "device deleted");
        Ok(())
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), DeviceError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String, DeviceError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(DeviceError::Command {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn device_ids_are_monotonic_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DmPool::new(dir.path(), "vpod-pool", "vpod", 1 << 30);
        let (id0, tx0) = pool.allocate_device_id().await.unwrap();
        let (id1, tx1) = pool.allocate_device_id().await.unwrap();
        assert_eq!(id1, id0 + 1);
        assert_eq!(tx1, tx0 + 1);

        // A fresh pool handle over the same root continues the sequence.
        let pool2 = DmPool::new(dir.path(), "vpod-pool", "vpod", 1 << 30);
        let (id2, _) = pool2.allocate_device_id().await.unwrap();
        assert_eq!(id2, id1 + 1);
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DmPool::new(dir.path(), "vpod-pool", "vpod", 1 << 30);
        let meta = DeviceMetadata {
            device_id: 7,
            device_size: 10 << 30,
            transaction_id: 3,
        };
        pool.write_metadata("c1", &meta).await.unwrap();
        assert_eq!(pool.read_metadata("c1").await.unwrap(), meta);
        assert!(pool.read_metadata("missing").await.is_err());
    }
}
