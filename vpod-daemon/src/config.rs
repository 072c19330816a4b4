//! Daemon configuration: defaults, JSON config file, CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vpod_vmm::hypervisor::VmBootConfig;
use vpod_vmm::pod::PodResource;
use vpod_vmm::vm::VmTimeouts;

use crate::error::DaemonError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// State root: the store, VM working dirs, container configs,
    /// device-mapper metadata.
    pub state_root: PathBuf,
    pub hypervisor: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    /// API listen address; migration peers are reached on the same port.
    pub listen: String,
    /// Address peers use to reach this host (NFS exports, share lists).
    pub advertise_ip: String,
    pub bridge: String,
    pub bridge_cidr: String,
    pub pool_name: String,
    pub dev_prefix: String,
    pub device_size: u64,
    /// Default incoming-migration port offered to peers.
    pub migration_port: u16,
    pub init_timeout_secs: u64,
    pub migrate_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("/var/lib/vpod"),
            hypervisor: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            kernel: PathBuf::from("/var/lib/vpod/kernel"),
            initrd: PathBuf::from("/var/lib/vpod/initrd.img"),
            listen: "0.0.0.0:1246".to_string(),
            advertise_ip: "127.0.0.1".to_string(),
            bridge: "vpod0".to_string(),
            bridge_cidr: "10.11.0.0/16".to_string(),
            pool_name: "vpod-pool".to_string(),
            dev_prefix: "vpod".to_string(),
            device_size: 10 << 30,
            migration_port: 4444,
            init_timeout_secs: 30,
            migrate_timeout_secs: 120,
        }
    }
}

impl DaemonConfig {
    /// Load from a JSON file; missing fields fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Failed(format!("read config {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| DaemonError::Protocol(format!("parse config {}: {e}", path.display())))
    }

    pub fn timeouts(&self) -> VmTimeouts {
        VmTimeouts {
            init: Duration::from_secs(self.init_timeout_secs),
            migrate: Duration::from_secs(self.migrate_timeout_secs),
        }
    }

    pub fn boot_config(&self, resource: &PodResource) -> VmBootConfig {
        VmBootConfig {
            hypervisor: self.hypervisor.clone(),
            kernel: self.kernel.clone(),
            initrd: self.initrd.clone(),
            cpu: resource.vcpu,
            memory_mb: resource.memory,
        }
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.state_root.join("containers")
    }
}
