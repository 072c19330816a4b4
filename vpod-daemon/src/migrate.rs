//! Live migration of a pod between peer daemons.
//!
//! The source packages pod metadata, container configs, device metadata and
//! the persisted VM record into one JSON envelope, exports its storage
//! backend over NFS, and hands the envelope to the target's `/pod/restore`.
//! The target rebuilds files, DB rows and devices, starts the hypervisor in
//! incoming mode with the source's exact SCSI/PCI layout, and returns the
//! memory port. The source then drives the monitor `migrate` command and
//! confirms or rolls back with `/vm/restore`. The source never deletes
//! local state before the target confirms success.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use vpod_vmm::device::{DmPool, NetworkPool, Provisioner, RestoreMode, TapDevice};
use vpod_vmm::error::VmError;
use vpod_vmm::pod::PodResource;
use vpod_vmm::vm::{VmOptions, VmPersistInfo, start_vm};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::registry::{PodRegistry, PodRecord, PodStatus};
use crate::store::{KvStore, keys};

/// The migration envelope. Field names are the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodPackage {
    #[serde(rename = "podid")]
    pub pod_id: String,
    #[serde(rename = "vmid")]
    pub vm_id: String,
    #[serde(rename = "vmdata")]
    pub vm_data: String,
    #[serde(rename = "podContainers")]
    pub pod_containers: String,
    #[serde(rename = "poddata")]
    pub pod_data: String,
    #[serde(rename = "containerList")]
    pub container_list: Vec<ContainerPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPackage {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "Hostconfig")]
    pub hostconfig: String,
    #[serde(rename = "Metadata")]
    pub metadata: String,
    #[serde(rename = "MetadataInit")]
    pub metadata_init: String,
}

/// Reply shape of the peer daemon's migration endpoints.
#[derive(Debug, Deserialize)]
struct RemoteReply {
    #[serde(rename = "Code")]
    code: i32,
    #[serde(rename = "Cause", default)]
    cause: String,
    #[serde(rename = "Port", default)]
    port: u16,
}

#[derive(Debug, Clone)]
struct PendingMigration {
    host: String,
    api_port: u16,
    mem_port: u16,
}

pub struct MigrateController {
    registry: Arc<PodRegistry>,
    store: Arc<KvStore>,
    config: Arc<DaemonConfig>,
    storage: Arc<DmPool>,
    network: Arc<NetworkPool>,
    provisioner: Arc<dyn Provisioner>,
    client: reqwest::Client,
    pending: Mutex<HashMap<String, PendingMigration>>,
}

impl MigrateController {
    pub fn new(
        registry: Arc<PodRegistry>,
        store: Arc<KvStore>,
        config: Arc<DaemonConfig>,
        storage: Arc<DmPool>,
        network: Arc<NetworkPool>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            storage,
            network,
            provisioner,
            client: reqwest::Client::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Source, phase one: package the pod, export storage, ship the
    /// envelope. The target's chosen memory port is remembered for phase
    /// two.
    pub async fn migrate_pod(
        &self,
        pod_id: &str,
        des_addr: &str,
        redirect_hook: Option<&str>,
        recover_hook: Option<&str>,
        mode: RestoreMode,
    ) -> Result<(), DaemonError> {
        let (host, api_port) = parse_addr(des_addr)?;
        if self.registry.lookup(pod_id).await.is_none() {
            return Err(DaemonError::NoSuchPod(pod_id.to_string()));
        }

        // A failing redirect hook aborts before anything crosses the wire.
        if let Some(script) = redirect_hook {
            if let Err(e) = run_hook(script, pod_id, &host).await {
                if let Some(recover) = recover_hook {
                    if let Err(re) = run_hook(recover, pod_id, &host).await {
                        warn!(pod = %pod_id, error = %re, "network recover hook failed");
                    }
                }
                return Err(DaemonError::Failed(format!("network redirect hook: {e}")));
            }
        }

        let package = gather_package(&self.store, &self.config, pod_id).await?;
        let backend = self.storage.backend_path();
        add_nfs_export(&host, &backend).await?;
        let share = format!("{}:{}", self.config.advertise_ip, backend.display());

        let url = format!("http://{host}:{api_port}/pod/restore");
        let envelope =
            serde_json::to_string(&package).map_err(|e| DaemonError::Failed(e.to_string()))?;
        let mode_name = match mode {
            RestoreMode::Snapshot => "snapshot",
            RestoreMode::Copy => "copy",
        };
        let suggested_port = self.config.migration_port.to_string();
        let reply = async {
            let resp = self
                .client
                .post(&url)
                .query(&[
                    ("migrateData", envelope.as_str()),
                    ("port", suggested_port.as_str()),
                    ("shareType", "nfs"),
                    ("shareList", share.as_str()),
                    ("restoreMode", mode_name),
                ])
                .send()
                .await
                .map_err(|e| DaemonError::Failed(format!("peer unreachable: {e}")))?;
            resp.json::<RemoteReply>()
                .await
                .map_err(|e| DaemonError::Protocol(format!("peer reply: {e}")))
        }
        .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                remove_nfs_export(&host, &backend).await;
                return Err(e);
            }
        };
        if reply.code != 0 {
            remove_nfs_export(&host, &backend).await;
            return Err(DaemonError::Failed(format!(
                "target restore failed: {}",
                reply.cause
            )));
        }

        info!(pod = %pod_id, %host, mem_port = reply.port, "pod package restored on target");
        self.pending.lock().unwrap().insert(
            pod_id.to_string(),
            PendingMigration {
                host,
                api_port,
                mem_port: reply.port,
            },
        );
        Ok(())
    }

    /// Source, phase two: copy VM memory, then confirm or roll back. The
    /// local pod is only cleaned after the target acknowledges success; on
    /// any failure after a completed memory copy the local VM is resumed.
    pub async fn migrate_vm(&self, pod_id: &str, des_addr: &str) -> Result<(), DaemonError> {
        let (host, api_port) = parse_addr(des_addr)?;
        let pending = self
            .pending
            .lock()
            .unwrap()
            .get(pod_id)
            .cloned()
            .unwrap_or(PendingMigration {
                host: host.clone(),
                api_port,
                mem_port: self.config.migration_port,
            });

        let handle = self
            .registry
            .vm_handle(pod_id)
            .await
            .ok_or_else(|| DaemonError::NoSuchPod(pod_id.to_string()))?;

        let mem_ok = match handle.migrate(&pending.host, pending.mem_port).await {
            Ok(()) => true,
            Err(VmError::MigrateTimeout) => false,
            Err(e) => {
                warn!(pod = %pod_id, error = %e, "memory migration failed");
                false
            }
        };

        let confirm = self
            .call_vm_restore(&pending.host, pending.api_port, pod_id, mem_ok)
            .await;

        let backend = self.storage.backend_path();
        let outcome = match (mem_ok, confirm) {
            (true, Ok(())) => {
                info!(pod = %pod_id, "migration confirmed, cleaning local pod");
                if let Err(e) = self.registry.delete_pod(pod_id).await {
                    warn!(pod = %pod_id, error = %e, "local pod cleanup failed");
                }
                Ok(())
            }
            (true, Err(e)) => {
                warn!(pod = %pod_id, error = %e, "confirmation failed, resuming local vm");
                if let Err(re) = handle.resume().await {
                    warn!(pod = %pod_id, error = %re, "resume failed");
                }
                Err(DaemonError::Failed(format!("target confirmation: {e}")))
            }
            (false, _) => {
                if let Err(re) = handle.resume().await {
                    warn!(pod = %pod_id, error = %re, "resume failed");
                }
                Err(DaemonError::MigrateTimeout)
            }
        };

        remove_nfs_export(&pending.host, &backend).await;
        self.pending.lock().unwrap().remove(pod_id);
        outcome
    }

    async fn call_vm_restore(
        &self,
        host: &str,
        api_port: u16,
        pod_id: &str,
        is_success: bool,
    ) -> Result<(), DaemonError> {
        let url = format!("http://{host}:{api_port}/vm/restore");
        let resp = self
            .client
            .post(&url)
            .query(&[
                ("podId", pod_id),
                ("isSuccess", if is_success { "true" } else { "false" }),
            ])
            .send()
            .await
            .map_err(|e| DaemonError::Failed(format!("peer unreachable: {e}")))?;
        let reply: RemoteReply = resp
            .json()
            .await
            .map_err(|e| DaemonError::Protocol(format!("peer reply: {e}")))?;
        if reply.code != 0 {
            return Err(DaemonError::Failed(reply.cause));
        }
        Ok(())
    }

    /// Target side: rebuild the pod from an envelope and start the
    /// hypervisor in incoming mode. Everything restored so far is rolled
    /// back on any failure.
    pub async fn restore_pod(
        &self,
        migrate_data: &str,
        port: Option<u16>,
        share_type: &str,
        share_list: &[String],
        mode: RestoreMode,
    ) -> Result<u16, DaemonError> {
        if share_type != "nfs" {
            return Err(DaemonError::Protocol(format!(
                "unsupported share type {share_type}"
            )));
        }
        let package: PodPackage = serde_json::from_str(migrate_data)
            .map_err(|e| DaemonError::Protocol(format!("bad envelope: {e}")))?;
        let mut record: PodRecord = serde_json::from_str(&package.pod_data)
            .map_err(|e| DaemonError::Protocol(format!("bad pod record: {e}")))?;

        match self.try_restore(&package, &mut record, port, share_list, mode).await {
            Ok(port) => Ok(port),
            Err(e) => {
                warn!(pod = %package.pod_id, error = %e, "restore failed, rolling back");
                self.rollback_restore(&package).await;
                Err(e)
            }
        }
    }

    async fn try_restore(
        &self,
        package: &PodPackage,
        record: &mut PodRecord,
        port: Option<u16>,
        share_list: &[String],
        mode: RestoreMode,
    ) -> Result<u16, DaemonError> {
        // Duplicate ids on this host fail the whole restore up front.
        if self.store.exists(&keys::vm_data(&package.vm_id)).await? {
            return Err(DaemonError::Busy(format!(
                "vm {} already exists here",
                package.vm_id
            )));
        }
        if self.store.exists(&keys::pod(&package.pod_id)).await?
            || self.registry.lookup(&package.pod_id).await.is_some()
        {
            return Err(DaemonError::Busy(format!(
                "pod {} already exists here",
                package.pod_id
            )));
        }

        restore_package_files(&self.config, package).await?;
        let info = localize_vm_data(&self.config, package)?;

        let share_src = share_list
            .first()
            .ok_or_else(|| DaemonError::Protocol("empty share list".to_string()))?;
        let mount_point = self.share_mount_point(&package.pod_id);
        mount_nfs(share_src, &mount_point).await?;

        // Image snapshots replay against the local pool; the image store
        // keeps base images in sync across hosts. Volumes carry their
        // path/format straight into the device arguments.
        restore_pool_devices(&self.storage, &info, mode).await?;

        restore_package_db(&self.store, package).await?;

        let mut taps: Vec<(usize, TapDevice)> = Vec::new();
        let mut tap_names: Vec<(usize, String)> = Vec::new();
        for netdev in &info.netdevs {
            let requested = netdev.ip.parse().ok();
            let tap = self.network.allocate_tap(requested).await?;
            tap_names.push((netdev.index, tap.name.clone()));
            taps.push((netdev.index, tap));
        }

        let chosen_port = port.unwrap_or(self.config.migration_port);
        let boot = self.config.boot_config(&PodResource {
            vcpu: info.cpu,
            memory: info.memory_mb,
        });
        let extra_args = restore_device_args(&info, &tap_names);
        let opts = VmOptions {
            vm_id: info.id.clone(),
            pod_id: package.pod_id.clone(),
            base_dir: self.config.state_root.clone(),
            boot,
            timeouts: self.config.timeouts(),
            incoming_port: Some(chosen_port),
            extra_args,
            restore: Some((Box::new(info), taps)),
        };
        let handle = start_vm(
            opts,
            self.provisioner.clone(),
            self.registry_lifecycle_sender(),
        )
        .await
        .map_err(DaemonError::from)?;

        record.status = PodStatus::Pending;
        record.vm_id = Some(package.vm_id.clone());
        self.registry
            .insert_restored(record.clone(), Some(handle))
            .await?;

        info!(pod = %package.pod_id, vm = %package.vm_id, port = chosen_port, "pod restored, awaiting incoming migration");
        Ok(chosen_port)
    }

    /// Target side: confirm or abandon a restored pod once the source
    /// reports the outcome of the memory copy.
    pub async fn restore_vm(&self, pod_id: &str, is_success: bool) -> Result<(), DaemonError> {
        if is_success {
            let vm_id = String::from_utf8(
                self.store.get_required(&keys::vm_by_pod(pod_id)).await?,
            )
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
            self.registry.set_status(pod_id, PodStatus::Running).await;
            let mount_point = self.share_mount_point(pod_id);
            unmount_nfs(&mount_point).await;
            info!(pod = %pod_id, vm = %vm_id, "migrated pod confirmed");
            return Ok(());
        }

        info!(pod = %pod_id, "dropping unconfirmed restored pod");
        let entry = self
            .registry
            .remove_entry(pod_id)
            .await
            .ok_or_else(|| DaemonError::NoSuchPod(pod_id.to_string()))?;
        if let Some(vm) = &entry.vm {
            vm.terminate().await;
        }

        let containers = entry.record.containers.clone();
        clear_container_files(&self.config, &containers).await;
        self.registry
            .purge_keys(pod_id, entry.record.vm_id.as_deref())
            .await;
        let mount_point = self.share_mount_point(pod_id);
        unmount_nfs(&mount_point).await;
        Ok(())
    }

    async fn rollback_restore(&self, package: &PodPackage) {
        if let Some(entry) = self.registry.remove_entry(&package.pod_id).await {
            if let Some(vm) = &entry.vm {
                vm.terminate().await;
            }
        }
        clear_package_db(&self.store, package).await;
        if let Ok(info) = localize_vm_data(&self.config, package) {
            for dev in &info.blockdevs {
                if dev.source == "volume" {
                    continue;
                }
                let _ = self.storage.delete_device(&dev.name).await;
            }
        }
        let containers: Vec<String> =
            package.container_list.iter().map(|c| c.id.clone()).collect();
        clear_container_files(&self.config, &containers).await;
        unmount_nfs(&self.share_mount_point(&package.pod_id)).await;
    }

    fn share_mount_point(&self, pod_id: &str) -> PathBuf {
        self.config.state_root.join("migrate").join(pod_id)
    }

    fn registry_lifecycle_sender(&self) -> tokio::sync::mpsc::Sender<vpod_vmm::vm::VmLifecycle> {
        self.registry.lifecycle_sender()
    }
}

/// Collect the pod's durable state into one envelope: the four DB rows plus
/// the per-container files.
pub(crate) async fn gather_package(
    store: &KvStore,
    config: &DaemonConfig,
    pod_id: &str,
) -> Result<PodPackage, DaemonError> {
    let vm_id = String::from_utf8(store.get_required(&keys::vm_by_pod(pod_id)).await?)
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;
    let vm_data = String::from_utf8(store.get_required(&keys::vm_data(&vm_id)).await?)
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;
    let pod_containers = String::from_utf8(store.get_required(&keys::pod_container(pod_id)).await?)
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;
    let pod_data = String::from_utf8(store.get_required(&keys::pod(pod_id)).await?)
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;

    let metadata_dir = config.state_root.join("devicemapper").join("metadata");
    let containers_dir = config.containers_dir();
    let mut container_list = Vec::new();
    for cid in pod_containers.split(':').filter(|c| !c.is_empty()) {
        container_list.push(ContainerPackage {
            id: cid.to_string(),
            config: read_or_empty(&containers_dir.join(cid).join("config.json")).await,
            hostconfig: read_or_empty(&containers_dir.join(cid).join("hostconfig.json")).await,
            metadata: read_or_empty(&metadata_dir.join(cid)).await,
            metadata_init: read_or_empty(&metadata_dir.join(format!("{cid}-init"))).await,
        });
    }

    Ok(PodPackage {
        pod_id: pod_id.to_string(),
        vm_id,
        vm_data,
        pod_containers,
        pod_data,
        container_list,
    })
}

/// Write the envelope's files onto local disk. Pre-existing files mean a
/// conflicting pod and fail the restore.
pub(crate) async fn restore_package_files(
    config: &DaemonConfig,
    package: &PodPackage,
) -> Result<(), DaemonError> {
    let metadata_dir = config.state_root.join("devicemapper").join("metadata");
    let containers_dir = config.containers_dir();
    tokio::fs::create_dir_all(&metadata_dir).await?;
    for container in &package.container_list {
        let dir = containers_dir.join(&container.id);
        tokio::fs::create_dir_all(&dir).await?;
        write_fresh(&dir.join("config.json"), &container.config).await?;
        write_fresh(&dir.join("hostconfig.json"), &container.hostconfig).await?;
        write_fresh(&metadata_dir.join(&container.id), &container.metadata).await?;
        write_fresh(
            &metadata_dir.join(format!("{}-init", container.id)),
            &container.metadata_init,
        )
        .await?;
    }
    Ok(())
}

/// Write the envelope's DB rows, refusing to overwrite existing ids.
pub(crate) async fn restore_package_db(
    store: &KvStore,
    package: &PodPackage,
) -> Result<(), DaemonError> {
    if store.exists(&keys::vm_data(&package.vm_id)).await? {
        return Err(DaemonError::Busy(format!(
            "vm {} already exists here",
            package.vm_id
        )));
    }
    if store.exists(&keys::pod(&package.pod_id)).await? {
        return Err(DaemonError::Busy(format!(
            "pod {} already exists here",
            package.pod_id
        )));
    }
    store
        .put(&keys::pod(&package.pod_id), package.pod_data.as_bytes())
        .await?;
    store
        .put(
            &keys::pod_container(&package.pod_id),
            package.pod_containers.as_bytes(),
        )
        .await?;
    store
        .put(&keys::vm_by_pod(&package.pod_id), package.vm_id.as_bytes())
        .await?;
    store
        .put(&keys::vm_data(&package.vm_id), package.vm_data.as_bytes())
        .await?;
    Ok(())
}

pub(crate) async fn clear_package_db(store: &KvStore, package: &PodPackage) {
    let _ = store.delete(&keys::vm_data(&package.vm_id)).await;
    let _ = store.delete(&keys::vm_by_pod(&package.pod_id)).await;
    let _ = store.delete(&keys::pod_container(&package.pod_id)).await;
    let _ = store.delete(&keys::pod(&package.pod_id)).await;
}

pub(crate) async fn clear_container_files(config: &DaemonConfig, containers: &[String]) {
    let metadata_dir = config.state_root.join("devicemapper").join("metadata");
    let containers_dir = config.containers_dir();
    for cid in containers {
        let _ = tokio::fs::remove_file(metadata_dir.join(cid)).await;
        let _ = tokio::fs::remove_file(metadata_dir.join(format!("{cid}-init"))).await;
        let _ = tokio::fs::remove_dir_all(containers_dir.join(cid)).await;
    }
}

/// Parse the envelope's VM record and point its image device paths at this
/// host's pool. Volumes keep the path and format the source recorded; only
/// image snapshots get rebuilt locally. Socket paths and the pid become
/// valid again once the incoming VM starts.
pub(crate) fn localize_vm_data(
    config: &DaemonConfig,
    package: &PodPackage,
) -> Result<VmPersistInfo, DaemonError> {
    let mut info: VmPersistInfo = serde_json::from_str(&package.vm_data)
        .map_err(|e| DaemonError::Protocol(format!("bad vm record: {e}")))?;
    for dev in &mut info.blockdevs {
        if dev.source == "image" {
            dev.path = format!("/dev/mapper/{}-{}", config.dev_prefix, dev.name);
        }
    }
    Ok(info)
}

/// Rebuild image snapshot devices by replaying their metadata against the
/// local pool. Volume devices never touch devicemapper restore: the envelope
/// only carries metadata files for container ids, and a volume's recorded
/// path/format goes straight into the hypervisor's device arguments.
pub(crate) async fn restore_pool_devices(
    storage: &DmPool,
    info: &VmPersistInfo,
    mode: RestoreMode,
) -> Result<(), DaemonError> {
    for dev in &info.blockdevs {
        if dev.source == "volume" {
            continue;
        }
        storage
            .restore_device(&dev.name, dev.origin.as_deref(), mode)
            .await?;
    }
    Ok(())
}

/// Device arguments for an incoming-mode hypervisor: the source's exact
/// SCSI/PCI layout, with freshly allocated taps bound by interface name.
pub(crate) fn restore_device_args(
    info: &VmPersistInfo,
    tap_names: &[(usize, String)],
) -> Vec<String> {
    let mut args = Vec::new();
    for dev in &info.blockdevs {
        args.push("-drive".to_string());
        args.push(format!(
            "file={},if=none,id=scsi-disk{},format={},cache=writeback",
            dev.path, dev.scsi_id, dev.format
        ));
        args.push("-device".to_string());
        args.push(format!(
            "scsi-hd,bus=scsi0.0,scsi-id={},drive=scsi-disk{},id=scsi-disk{}",
            dev.scsi_id, dev.scsi_id, dev.scsi_id
        ));
    }
    for netdev in &info.netdevs {
        let tap = tap_names
            .iter()
            .find(|(index, _)| *index == netdev.index)
            .map(|(_, name)| name.as_str())
            .unwrap_or("tap0");
        args.push("-netdev".to_string());
        args.push(format!(
            "tap,id={},ifname={tap},script=no,downscript=no",
            netdev.device
        ));
        args.push("-device".to_string());
        args.push(format!(
            "virtio-net-pci,netdev={},bus=pci.0,addr={:#x},id={}",
            netdev.device, netdev.pci_addr, netdev.device
        ));
    }
    args
}

pub(crate) fn parse_addr(addr: &str) -> Result<(String, u16), DaemonError> {
    let mut parts = addr.split(':');
    let host = parts.next().unwrap_or_default();
    let port = parts.next().and_then(|p| p.parse().ok());
    match (host.is_empty(), port, parts.next()) {
        (false, Some(port), None) => Ok((host.to_string(), port)),
        _ => Err(DaemonError::Protocol(format!("not a legal address: {addr}"))),
    }
}

async fn run_hook(script: &str, pod_id: &str, des_host: &str) -> Result<(), DaemonError> {
    let output = Command::new(script)
        .arg(pod_id)
        .arg(des_host)
        .output()
        .await?;
    if !output.status.success() {
        return Err(DaemonError::Failed(format!(
            "{script}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn add_nfs_export(client_host: &str, path: &Path) -> Result<(), DaemonError> {
    run_cmd(
        "exportfs",
        &[
            "-o",
            "rw,no_root_squash,async",
            &format!("{client_host}:{}", path.display()),
        ],
    )
    .await
}

async fn remove_nfs_export(client_host: &str, path: &Path) {
    if let Err(e) = run_cmd(
        "exportfs",
        &["-u", &format!("{client_host}:{}", path.display())],
    )
    .await
    {
        warn!(error = %e, "removing nfs export failed");
    }
}

async fn mount_nfs(remote: &str, target: &Path) -> Result<(), DaemonError> {
    tokio::fs::create_dir_all(target).await?;
    run_cmd(
        "mount",
        &["-t", "nfs", remote, &target.display().to_string()],
    )
    .await
}

async fn unmount_nfs(target: &Path) {
    let _ = run_cmd("umount", &[&target.display().to_string()]).await;
    let _ = tokio::fs::remove_dir(target).await;
}

async fn run_cmd(program: &str, args: &[&str]) -> Result<(), DaemonError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(DaemonError::Failed(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

async fn read_or_empty(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

/// Refuse to clobber files belonging to another pod. Empty content writes
/// nothing, matching gather's treatment of absent files.
async fn write_fresh(path: &Path, content: &str) -> Result<(), DaemonError> {
    if content.is_empty() {
        return Ok(());
    }
    if tokio::fs::try_exists(path).await? {
        return Err(DaemonError::Busy(format!(
            "{} already exists",
            path.display()
        )));
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
