//! Per-VM device bookkeeping and the device-readiness predicate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use tracing::warn;

use crate::descriptor::{VmContainer, VmEnv, VmFsmap, VmInterface, VmPod, VmRoute, VmVolume};
use crate::device::DeviceMetadata;
use crate::hypervisor::{PCI_ADDR_BASE, VmBootConfig, VmPaths};
use crate::pod::{UserPod, UserPortMapping};
use crate::vm::events::BlockSource;
use crate::vm::persist::{BlockDevRecord, NetDevRecord, SerialPortRecord, VmPersistInfo};

pub const SCSI_ID_BASE: u32 = 0;

/// A block device attached (or being attached) to the VM.
pub struct BlockDev {
    pub name: String,
    pub source: BlockSource,
    pub path: PathBuf,
    pub format: String,
    pub fstype: String,
    pub scsi_id: u32,
    pub guest_device: String,
    pub metadata: DeviceMetadata,
    /// Parent image id for snapshot devices; None for volumes.
    pub origin: Option<String>,
}

/// A tap-backed NIC attached (or being attached) to the VM. The tap fd stays
/// open here until cleanup; the hypervisor holds a duplicate.
pub struct NetDev {
    pub index: usize,
    /// Guest-visible device and netdev id, "eth<index>".
    pub device: String,
    pub tap_name: String,
    pub file: File,
    pub pci_addr: u32,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub ports: Vec<UserPortMapping>,
}

pub struct SerialPortDev {
    pub index: usize,
    pub socket: PathBuf,
    pub name: String,
}

/// Hot-plug progress per device class. `adding` holds devices whose host
/// side is done and whose hot-plug is in flight; `present` holds devices the
/// monitor acknowledged. A device is in at most one of the two.
#[derive(Default)]
pub struct DeviceProgress {
    planned_block: HashSet<String>,
    adding_block: HashSet<String>,
    present_block: HashSet<String>,
    planned_net: HashSet<usize>,
    adding_net: HashSet<usize>,
    present_net: HashSet<usize>,
}

impl DeviceProgress {
    pub fn plan_block(&mut self, name: &str) {
        self.planned_block.insert(name.to_string());
    }

    pub fn plan_net(&mut self, index: usize) {
        self.planned_net.insert(index);
    }

    pub fn block_adding(&mut self, name: &str) {
        if self.present_block.contains(name) {
            warn!(device = name, "block device re-added while present");
            return;
        }
        self.adding_block.insert(name.to_string());
    }

    pub fn net_adding(&mut self, index: usize) {
        if self.present_net.contains(&index) {
            warn!(index, "netdev re-added while present");
            return;
        }
        self.adding_net.insert(index);
    }

    /// Move a block device from adding to present. False for unknown or
    /// duplicate insertions.
    pub fn block_inserted(&mut self, name: &str) -> bool {
        if !self.adding_block.remove(name) {
            return false;
        }
        self.present_block.insert(name.to_string())
    }

    pub fn net_inserted(&mut self, index: usize) -> bool {
        if !self.adding_net.remove(&index) {
            return false;
        }
        self.present_net.insert(index)
    }

    /// True once nothing is in flight and every planned device was
    /// acknowledged.
    pub fn device_ready(&self) -> bool {
        self.adding_block.is_empty()
            && self.adding_net.is_empty()
            && self.planned_block.is_subset(&self.present_block)
            && self.planned_net.is_subset(&self.present_net)
    }
}

/// All state owned by one VM coordinator. Only the coordinator task touches
/// this.
pub struct VmContext {
    pub id: String,
    pub pod_id: String,
    pub paths: VmPaths,
    pub boot: VmBootConfig,
    pub share_dir: PathBuf,
    pub pid: Option<u32>,
    next_scsi_id: u32,
    next_pci_addr: u32,
    pub progress: DeviceProgress,
    pub blockdevs: HashMap<String, BlockDev>,
    pub netdevs: BTreeMap<usize, NetDev>,
    pub serial_ports: Vec<SerialPortDev>,
    pub spec: Option<UserPod>,
}

impl VmContext {
    pub fn new(id: &str, pod_id: &str, paths: VmPaths, boot: VmBootConfig) -> Self {
        Self {
            id: id.to_string(),
            pod_id: pod_id.to_string(),
            paths,
            boot,
            share_dir: PathBuf::new(),
            pid: None,
            next_scsi_id: SCSI_ID_BASE,
            next_pci_addr: PCI_ADDR_BASE,
            progress: DeviceProgress::default(),
            blockdevs: HashMap::new(),
            netdevs: BTreeMap::new(),
            serial_ports: Vec::new(),
            spec: None,
        }
    }

    /// Rebuild a context from a migrated VM record. The devices are already
    /// part of the hypervisor command line, so they count as present; the
    /// counters continue where the source VM left off.
    pub fn restore(
        info: &VmPersistInfo,
        paths: VmPaths,
        boot: VmBootConfig,
        taps: Vec<(usize, crate::device::TapDevice)>,
    ) -> Self {
        let mut ctx = Self::new(&info.id, &info.pod_id, paths, boot);
        ctx.next_scsi_id = info.next_scsi_id;
        ctx.next_pci_addr = info.next_pci_addr;
        for rec in &info.blockdevs {
            ctx.progress.plan_block(&rec.name);
            ctx.progress.block_adding(&rec.name);
            ctx.progress.block_inserted(&rec.name);
            ctx.blockdevs.insert(rec.name.clone(), rec.to_blockdev());
        }
        let mut tap_files: HashMap<usize, crate::device::TapDevice> = taps.into_iter().collect();
        for rec in &info.netdevs {
            let Some(tap) = tap_files.remove(&rec.index) else {
                warn!(index = rec.index, "restored netdev has no tap");
                continue;
            };
            ctx.progress.plan_net(rec.index);
            ctx.progress.net_adding(rec.index);
            ctx.progress.net_inserted(rec.index);
            ctx.netdevs.insert(
                rec.index,
                NetDev {
                    index: rec.index,
                    device: rec.device.clone(),
                    tap_name: tap.name.clone(),
                    file: tap.file,
                    pci_addr: rec.pci_addr,
                    ip: rec.ip.parse().unwrap_or(tap.ip),
                    prefix_len: rec.prefix_len,
                    gateway: rec.gateway.parse().unwrap_or(tap.gateway),
                    ports: rec.ports.clone(),
                },
            );
        }
        for rec in &info.serial_ports {
            ctx.serial_ports.push(SerialPortDev {
                index: rec.index,
                socket: PathBuf::from(&rec.socket),
                name: rec.name.clone(),
            });
        }
        ctx
    }

    pub fn next_scsi_id(&mut self) -> u32 {
        let id = self.next_scsi_id;
        self.next_scsi_id += 1;
        id
    }

    pub fn next_pci_addr(&mut self) -> u32 {
        let addr = self.next_pci_addr;
        self.next_pci_addr += 1;
        addr
    }

    pub fn device_ready(&self) -> bool {
        self.progress.device_ready()
    }

    /// The persisted VM record: everything a peer daemon needs to rebuild
    /// the same device topology, counters included.
    pub fn persist_info(&self) -> VmPersistInfo {
        let mut blockdevs: Vec<BlockDevRecord> =
            self.blockdevs.values().map(BlockDevRecord::from).collect();
        blockdevs.sort_by_key(|b| b.scsi_id);
        VmPersistInfo {
            id: self.id.clone(),
            pod_id: self.pod_id.clone(),
            cpu: self.boot.cpu,
            memory_mb: self.boot.memory_mb,
            home_dir: self.paths.root().display().to_string(),
            monitor_sock: self.paths.monitor_socket().display().to_string(),
            hyper_sock: self.paths.hyper_socket().display().to_string(),
            tty_sock: self.paths.tty_socket().display().to_string(),
            share_dir: self.share_dir.display().to_string(),
            pid: self.pid,
            next_scsi_id: self.next_scsi_id,
            next_pci_addr: self.next_pci_addr,
            blockdevs,
            netdevs: self.netdevs.values().map(NetDevRecord::from).collect(),
            serial_ports: self
                .serial_ports
                .iter()
                .map(|s| SerialPortRecord {
                    index: s.index,
                    socket: s.socket.display().to_string(),
                    name: s.name.clone(),
                })
                .collect(),
        }
    }

    /// Render the START_POD descriptor from the resolved devices. Only valid
    /// once device-ready.
    pub fn render_descriptor(&self) -> VmPod {
        let spec = self.spec.as_ref().expect("descriptor needs a pod spec");
        let containers = spec
            .containers
            .iter()
            .map(|c| {
                let rootfs = self
                    .blockdevs
                    .get(&c.id)
                    .map(|b| b.guest_device.clone())
                    .unwrap_or_default();
                let fstype = self
                    .blockdevs
                    .get(&c.id)
                    .map(|b| b.fstype.clone())
                    .unwrap_or_else(|| "ext4".to_string());
                VmContainer {
                    id: c.id.clone(),
                    rootfs,
                    fstype,
                    image: c.image.clone(),
                    volumes: c
                        .volumes
                        .iter()
                        .filter_map(|r| {
                            let dev = self.blockdevs.get(&r.volume)?;
                            Some(VmVolume {
                                device: dev.guest_device.clone(),
                                mount: r.mount.clone(),
                                fstype: dev.fstype.clone(),
                                read_only: r.read_only,
                            })
                        })
                        .collect(),
                    fsmap: c
                        .fsmap
                        .iter()
                        .map(|f| VmFsmap {
                            source: f.source.clone(),
                            path: f.path.clone(),
                            read_only: f.read_only,
                        })
                        .collect(),
                    tty: c.tty.clone(),
                    workdir: c.workdir.clone(),
                    cmd: c.cmd.clone(),
                    envs: c
                        .envs
                        .iter()
                        .map(|e| VmEnv {
                            env: e.env.clone(),
                            value: e.value.clone(),
                        })
                        .collect(),
                    restart_policy: c.restart_policy.clone(),
                }
            })
            .collect();

        let interfaces = self
            .netdevs
            .values()
            .map(|n| VmInterface {
                device: n.device.clone(),
                ip_address: n.ip.to_string(),
                net_mask: netmask_string(n.ip, n.prefix_len),
            })
            .collect();

        let mut routes: Vec<VmRoute> = spec
            .routes
            .iter()
            .map(|r| VmRoute {
                dest: r.dest.clone(),
                gateway: r.gateway.clone(),
                device: r.device.clone(),
            })
            .collect();
        if routes.is_empty() {
            if let Some(first) = self.netdevs.values().next() {
                routes.push(VmRoute {
                    dest: "0.0.0.0/0".to_string(),
                    gateway: first.gateway.to_string(),
                    device: first.device.clone(),
                });
            }
        }

        VmPod {
            hostname: if spec.hostname.is_empty() {
                self.pod_id.clone()
            } else {
                spec.hostname.clone()
            },
            containers,
            interfaces,
            routes,
            socket: self.paths.tty_socket().display().to_string(),
            share_dir: crate::device::share::SHARE_DIR_TAG.to_string(),
        }
    }
}

fn netmask_string(ip: Ipv4Addr, prefix_len: u8) -> String {
    match Ipv4Net::new(ip, prefix_len) {
        Ok(net) => net.netmask().to_string(),
        Err(_) => "255.255.255.255".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_and_present_stay_disjoint() {
        let mut p = DeviceProgress::default();
        p.plan_block("c1");
        p.plan_block("v1");
        assert!(!p.device_ready());

        p.block_adding("c1");
        assert!(!p.device_ready());
        assert!(p.block_inserted("c1"));
        // A second insertion for the same device is rejected.
        assert!(!p.block_inserted("c1"));
        // Re-adding a present device is a no-op.
        p.block_adding("c1");
        assert!(!p.device_ready());

        p.block_adding("v1");
        assert!(p.block_inserted("v1"));
        assert!(p.device_ready());
    }

    #[test]
    fn readiness_requires_all_planned_devices() {
        let mut p = DeviceProgress::default();
        p.plan_block("c1");
        p.plan_net(0);
        p.block_adding("c1");
        assert!(p.block_inserted("c1"));
        assert!(!p.device_ready());
        p.net_adding(0);
        assert!(!p.device_ready());
        assert!(p.net_inserted(0));
        assert!(p.device_ready());
    }

    #[test]
    fn unplanned_insertion_is_rejected() {
        let mut p = DeviceProgress::default();
        assert!(!p.block_inserted("ghost"));
        assert!(!p.net_inserted(7));
        assert!(p.device_ready());
    }

    #[test]
    fn counters_are_deterministic() {
        let paths = VmPaths::new(std::path::Path::new("/tmp/vpod-test"), "vm-x");
        let boot = VmBootConfig {
            hypervisor: "/usr/bin/qemu-system-x86_64".into(),
            kernel: "/boot/kernel".into(),
            initrd: "/boot/initrd".into(),
            cpu: 1,
            memory_mb: 128,
        };
        let mut ctx = VmContext::new("vm-x", "pod-x", paths, boot);
        assert_eq!(ctx.next_scsi_id(), 0);
        assert_eq!(ctx.next_scsi_id(), 1);
        assert_eq!(ctx.next_pci_addr(), PCI_ADDR_BASE);
        assert_eq!(ctx.next_pci_addr(), PCI_ADDR_BASE + 1);
    }
}
