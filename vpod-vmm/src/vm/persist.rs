//! The durable VM record.
//!
//! Stored under `vmdata-<vmId>` and shipped inside migration envelopes. The
//! resource counters and the full device list are part of the record so a
//! restored VM reproduces the exact SCSI/PCI topology of the source.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceMetadata;
use crate::pod::UserPortMapping;
use crate::vm::context::{BlockDev, NetDev};
use crate::vm::events::BlockSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmPersistInfo {
    pub id: String,
    pub pod_id: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub home_dir: String,
    pub monitor_sock: String,
    pub hyper_sock: String,
    pub tty_sock: String,
    pub share_dir: String,
    pub pid: Option<u32>,
    pub next_scsi_id: u32,
    pub next_pci_addr: u32,
    #[serde(default)]
    pub blockdevs: Vec<BlockDevRecord>,
    #[serde(default)]
    pub netdevs: Vec<NetDevRecord>,
    #[serde(default)]
    pub serial_ports: Vec<SerialPortRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevRecord {
    pub name: String,
    /// "image" or "volume".
    pub source: String,
    pub path: String,
    pub format: String,
    pub fstype: String,
    pub scsi_id: u32,
    pub guest_device: String,
    pub metadata: DeviceMetadata,
    #[serde(default)]
    pub origin: Option<String>,
}

impl From<&BlockDev> for BlockDevRecord {
    fn from(dev: &BlockDev) -> Self {
        Self {
            name: dev.name.clone(),
            source: dev.source.to_string(),
            path: dev.path.display().to_string(),
            format: dev.format.clone(),
            fstype: dev.fstype.clone(),
            scsi_id: dev.scsi_id,
            guest_device: dev.guest_device.clone(),
            metadata: dev.metadata.clone(),
            origin: dev.origin.clone(),
        }
    }
}

impl BlockDevRecord {
    pub fn to_blockdev(&self) -> BlockDev {
        BlockDev {
            name: self.name.clone(),
            source: if self.source == "volume" {
                BlockSource::Volume
            } else {
                BlockSource::Image
            },
            path: PathBuf::from(&self.path),
            format: self.format.clone(),
            fstype: self.fstype.clone(),
            scsi_id: self.scsi_id,
            guest_device: self.guest_device.clone(),
            metadata: self.metadata.clone(),
            origin: self.origin.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetDevRecord {
    pub index: usize,
    pub device: String,
    pub pci_addr: u32,
    pub ip: String,
    pub prefix_len: u8,
    pub gateway: String,
    #[serde(default)]
    pub ports: Vec<UserPortMapping>,
}

impl From<&NetDev> for NetDevRecord {
    fn from(dev: &NetDev) -> Self {
        Self {
            index: dev.index,
            device: dev.device.clone(),
            pci_addr: dev.pci_addr,
            ip: dev.ip.to_string(),
            prefix_len: dev.prefix_len,
            gateway: dev.gateway.to_string(),
            ports: dev.ports.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialPortRecord {
    pub index: usize,
    pub socket: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let info = VmPersistInfo {
            id: "vm-1".into(),
            pod_id: "pod-1".into(),
            cpu: 2,
            memory_mb: 256,
            home_dir: "/var/lib/vpod/vm/vm-1".into(),
            monitor_sock: "/var/lib/vpod/vm/vm-1/monitor.sock".into(),
            hyper_sock: "/var/lib/vpod/vm/vm-1/hyper.sock".into(),
            tty_sock: "/var/lib/vpod/vm/vm-1/tty.sock".into(),
            share_dir: "/var/lib/vpod/vm/vm-1/share_dir".into(),
            pid: Some(4242),
            next_scsi_id: 2,
            next_pci_addr: 0x06,
            blockdevs: vec![BlockDevRecord {
                name: "c1".into(),
                source: "image".into(),
                path: "/dev/mapper/vpod-c1".into(),
                format: "raw".into(),
                fstype: "ext4".into(),
                scsi_id: 0,
                guest_device: "sda".into(),
                metadata: DeviceMetadata {
                    device_id: 12,
                    device_size: 10 << 30,
                    transaction_id: 9,
                },
                origin: Some("img1".into()),
            }],
            netdevs: vec![NetDevRecord {
                index: 0,
                device: "eth0".into(),
                pci_addr: 0x05,
                ip: "10.11.0.2".into(),
                prefix_len: 16,
                gateway: "10.11.0.1".into(),
                ports: vec![],
            }],
            serial_ports: vec![],
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: VmPersistInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn blockdev_record_conversion_preserves_source() {
        let rec = BlockDevRecord {
            name: "v1".into(),
            source: "volume".into(),
            path: "/dev/mapper/vpod-v1".into(),
            format: "raw".into(),
            fstype: "ext4".into(),
            scsi_id: 1,
            guest_device: "sdb".into(),
            metadata: DeviceMetadata::default(),
            origin: None,
        };
        let dev = rec.to_blockdev();
        assert_eq!(dev.source, BlockSource::Volume);
        assert_eq!(BlockDevRecord::from(&dev), rec);
    }
}
