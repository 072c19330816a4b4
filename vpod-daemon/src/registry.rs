//! The pod registry: the process-wide table of pods and their VMs.
//!
//! All mutations hold the exclusive lock; nothing under the lock awaits a
//! coordinator reply, and lifecycle events arrive on a separate channel
//! drained outside the lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use vpod_vmm::device::Provisioner;
use vpod_vmm::pod::UserPod;
use vpod_vmm::vm::{VmHandle, VmLifecycle, VmOptions, start_vm};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::store::{KvStore, StoreError, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

/// The durable pod record, stored under `pod-<podId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: String,
    pub spec: UserPod,
    pub status: PodStatus,
    pub vm_id: Option<String>,
    pub containers: Vec<String>,
}

pub struct PodEntry {
    pub record: PodRecord,
    pub vm: Option<VmHandle>,
}

#[derive(Debug, Serialize)]
pub struct PodSummary {
    pub id: String,
    pub status: PodStatus,
    pub vm: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VmSummary {
    pub id: String,
    pub pod: String,
}

pub struct PodRegistry {
    pods: RwLock<HashMap<String, PodEntry>>,
    store: Arc<KvStore>,
    config: Arc<DaemonConfig>,
    provisioner: Arc<dyn Provisioner>,
    lifecycle_tx: mpsc::Sender<VmLifecycle>,
}

impl PodRegistry {
    pub fn new(
        store: Arc<KvStore>,
        config: Arc<DaemonConfig>,
        provisioner: Arc<dyn Provisioner>,
        lifecycle_tx: mpsc::Sender<VmLifecycle>,
    ) -> Self {
        Self {
            pods: RwLock::new(HashMap::new()),
            store,
            config,
            provisioner,
            lifecycle_tx,
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn lifecycle_sender(&self) -> mpsc::Sender<VmLifecycle> {
        self.lifecycle_tx.clone()
    }

    /// Admit a pod spec, persist its record, and lay down the per-container
    /// config files.
    pub async fn create_pod(&self, mut spec: UserPod) -> Result<String, DaemonError> {
        spec.validate().map_err(DaemonError::Protocol)?;
        if spec.id.is_empty() {
            spec.id = format!("pod-{}", &Uuid::new_v4().simple().to_string()[..12]);
        }
        let pod_id = spec.id.clone();

        let mut pods = self.pods.write().await;
        if pods.contains_key(&pod_id) || self.store.exists(&keys::pod(&pod_id)).await? {
            return Err(DaemonError::Busy(format!("pod {pod_id} already exists")));
        }

        let containers: Vec<String> = spec.containers.iter().map(|c| c.id.clone()).collect();
        let record = PodRecord {
            id: pod_id.clone(),
            spec,
            status: PodStatus::Pending,
            vm_id: None,
            containers,
        };

        self.write_container_configs(&record).await?;
        self.persist_record(&record).await?;
        pods.insert(
            pod_id.clone(),
            PodEntry {
                record,
                vm: None,
            },
        );
        info!(pod = %pod_id, "pod created");
        Ok(pod_id)
    }

    /// Start the pod's VM and run the pod in it. Resolves when the pod is
    /// RUNNING or the bring-up failed.
    pub async fn start_pod(&self, pod_id: &str) -> Result<(), DaemonError> {
        let spec = {
            let pods = self.pods.read().await;
            let entry = pods
                .get(pod_id)
                .ok_or_else(|| DaemonError::NoSuchPod(pod_id.to_string()))?;
            if entry.vm.is_some() {
                return Err(DaemonError::Busy(pod_id.to_string()));
            }
            entry.record.spec.clone()
        };

        let vm_id = format!("vm-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let opts = VmOptions {
            vm_id: vm_id.clone(),
            pod_id: pod_id.to_string(),
            base_dir: self.config.state_root.clone(),
            boot: self.config.boot_config(&spec.resource),
            timeouts: self.config.timeouts(),
            incoming_port: None,
            extra_args: Vec::new(),
            restore: None,
        };
        let handle = start_vm(opts, self.provisioner.clone(), self.lifecycle_tx.clone())
            .await
            .map_err(DaemonError::from)?;

        self.associate_vm(pod_id, &vm_id, Some(handle.clone())).await?;

        // The reply is awaited without the lock; the coordinator may post
        // lifecycle events meanwhile.
        match handle.run_pod(spec).await {
            Ok(()) => {
                info!(pod = %pod_id, vm = %vm_id, "pod running");
                Ok(())
            }
            Err(e) => {
                warn!(pod = %pod_id, vm = %vm_id, error = %e, "pod start failed");
                self.set_status(pod_id, PodStatus::Failed).await;
                Err(e.into())
            }
        }
    }

    /// Bind a VM to a pod. `handle` is None when re-associating a restored
    /// record without a live control channel.
    pub async fn associate_vm(
        &self,
        pod_id: &str,
        vm_id: &str,
        handle: Option<VmHandle>,
    ) -> Result<(), DaemonError> {
        let mut pods = self.pods.write().await;
        let entry = pods
            .get_mut(pod_id)
            .ok_or_else(|| DaemonError::NoSuchPod(pod_id.to_string()))?;
        entry.record.vm_id = Some(vm_id.to_string());
        entry.vm = handle;
        let record = entry.record.clone();
        drop(pods);

        self.store
            .put(&keys::vm_by_pod(pod_id), vm_id.as_bytes())
            .await?;
        self.persist_record(&record).await?;
        Ok(())
    }

    pub async fn stop_pod(&self, pod_id: &str) -> Result<(), DaemonError> {
        let handle = {
            let pods = self.pods.read().await;
            let entry = pods
                .get(pod_id)
                .ok_or_else(|| DaemonError::NoSuchPod(pod_id.to_string()))?;
            entry
                .vm
                .clone()
                .ok_or_else(|| DaemonError::Failed(format!("pod {pod_id} has no vm")))?
        };
        handle.stop().await.map_err(DaemonError::from)
    }

    /// Remove a pod and every key derived from it. A live VM is terminated
    /// without the graceful guest dialog.
    pub async fn delete_pod(&self, pod_id: &str) -> Result<(), DaemonError> {
        let entry = {
            let mut pods = self.pods.write().await;
            pods.remove(pod_id)
        };
        let Some(entry) = entry else {
            return Err(DaemonError::NoSuchPod(pod_id.to_string()));
        };
        if let Some(vm) = entry.vm {
            vm.terminate().await;
        }
        self.purge_keys(pod_id, entry.record.vm_id.as_deref()).await;
        info!(pod = %pod_id, "pod deleted");
        Ok(())
    }

    pub async fn purge_keys(&self, pod_id: &str, vm_id: Option<&str>) {
        let _ = self.store.delete(&keys::pod(pod_id)).await;
        let _ = self.store.delete(&keys::pod_container(pod_id)).await;
        let _ = self.store.delete(&keys::vm_by_pod(pod_id)).await;
        if let Some(vm_id) = vm_id {
            let _ = self.store.delete(&keys::vm_data(vm_id)).await;
        }
    }

    pub async fn lookup(&self, pod_id: &str) -> Option<PodRecord> {
        self.pods
            .read()
            .await
            .get(pod_id)
            .map(|e| e.record.clone())
    }

    pub async fn vm_handle(&self, pod_id: &str) -> Option<VmHandle> {
        self.pods.read().await.get(pod_id).and_then(|e| e.vm.clone())
    }

    pub async fn list_pods(&self) -> Vec<PodSummary> {
        let pods = self.pods.read().await;
        let mut out: Vec<PodSummary> = pods
            .values()
            .map(|e| PodSummary {
                id: e.record.id.clone(),
                status: e.record.status,
                vm: e.record.vm_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn list_vms(&self) -> Vec<VmSummary> {
        let pods = self.pods.read().await;
        let mut out: Vec<VmSummary> = pods
            .values()
            .filter_map(|e| {
                e.record.vm_id.as_ref().map(|vm| VmSummary {
                    id: vm.clone(),
                    pod: e.record.id.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Insert a pod restored from a migration envelope.
    pub async fn insert_restored(
        &self,
        record: PodRecord,
        handle: Option<VmHandle>,
    ) -> Result<(), DaemonError> {
        let mut pods = self.pods.write().await;
        if pods.contains_key(&record.id) {
            return Err(DaemonError::Busy(format!(
                "pod {} already exists",
                record.id
            )));
        }
        pods.insert(record.id.clone(), PodEntry { record, vm: handle });
        Ok(())
    }

    /// Drop a restored pod that never got confirmed.
    pub async fn remove_entry(&self, pod_id: &str) -> Option<PodEntry> {
        self.pods.write().await.remove(pod_id)
    }

    pub async fn set_status(&self, pod_id: &str, status: PodStatus) {
        let record = {
            let mut pods = self.pods.write().await;
            let Some(entry) = pods.get_mut(pod_id) else {
                return;
            };
            entry.record.status = status;
            entry.record.clone()
        };
        if let Err(e) = self.persist_record(&record).await {
            warn!(pod = %pod_id, error = %e, "persisting status failed");
        }
    }

    /// Apply a coordinator lifecycle event. Called from the drain task.
    pub async fn handle_lifecycle(&self, event: VmLifecycle) {
        match event {
            VmLifecycle::Running {
                pod_id,
                vm_id,
                persist,
            } => {
                info!(pod = %pod_id, vm = %vm_id, "lifecycle: running");
                match serde_json::to_vec(&*persist) {
                    Ok(blob) => {
                        if let Err(e) = self.store.put(&keys::vm_data(&vm_id), &blob).await {
                            warn!(vm = %vm_id, error = %e, "persisting vm data failed");
                        }
                    }
                    Err(e) => warn!(vm = %vm_id, error = %e, "vm data serialization failed"),
                }
                self.set_status(&pod_id, PodStatus::Running).await;
            }
            VmLifecycle::Stopped {
                pod_id,
                vm_id,
                reason,
            } => {
                info!(pod = %pod_id, vm = %vm_id, %reason, "lifecycle: stopped");
                {
                    let mut pods = self.pods.write().await;
                    if let Some(entry) = pods.get_mut(&pod_id) {
                        entry.vm = None;
                        entry.record.vm_id = None;
                        entry.record.status = PodStatus::Stopped;
                    }
                }
                let _ = self.store.delete(&keys::vm_by_pod(&pod_id)).await;
                let _ = self.store.delete(&keys::vm_data(&vm_id)).await;
                if let Some(record) = self.lookup(&pod_id).await {
                    if let Err(e) = self.persist_record(&record).await {
                        warn!(pod = %pod_id, error = %e, "persisting stop failed");
                    }
                }
            }
        }
    }

    /// Restart recovery: reload every `pod-*` record. Pods whose hypervisor
    /// is gone are marked STOPPED; live ones keep their association, but no
    /// control channel is re-established.
    pub async fn recover(&self) -> Result<(), DaemonError> {
        let pod_keys = self.store.keys_with_prefix(keys::POD_PREFIX).await?;
        for key in pod_keys {
            if key.starts_with(keys::POD_CONTAINER_PREFIX) {
                continue;
            }
            let Some(blob) = self.store.get(&key).await? else {
                continue;
            };
            let mut record: PodRecord = match serde_json::from_slice(&blob) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%key, error = %e, "skipping unreadable pod record");
                    continue;
                }
            };
            let pod_id = record.id.clone();

            let vm_alive = match &record.vm_id {
                Some(vm_id) => match self.store.get(&keys::vm_data(vm_id)).await? {
                    Some(data) => serde_json::from_slice::<vpod_vmm::vm::VmPersistInfo>(&data)
                        .ok()
                        .and_then(|info| info.pid)
                        .map(process_alive)
                        .unwrap_or(false),
                    None => false,
                },
                None => false,
            };

            if !vm_alive && record.status == PodStatus::Running {
                info!(pod = %pod_id, "vm gone across restart, marking stopped");
                let vm_id = record.vm_id.take();
                record.status = PodStatus::Stopped;
                let _ = self.store.delete(&keys::vm_by_pod(&pod_id)).await;
                if let Some(vm_id) = vm_id {
                    let _ = self.store.delete(&keys::vm_data(&vm_id)).await;
                }
                self.persist_record(&record).await?;
            }

            self.pods.write().await.insert(
                pod_id.clone(),
                PodEntry {
                    record,
                    vm: None,
                },
            );
            info!(pod = %pod_id, "pod recovered");
        }
        Ok(())
    }

    pub async fn persist_record(&self, record: &PodRecord) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(record).expect("pod record serializes");
        self.store.put(&keys::pod(&record.id), &blob).await?;
        self.store
            .put(
                &keys::pod_container(&record.id),
                record.containers.join(":").as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Per-container config files, the on-disk layout migration ships.
    async fn write_container_configs(&self, record: &PodRecord) -> Result<(), DaemonError> {
        for container in &record.spec.containers {
            let dir = self.config.containers_dir().join(&container.id);
            tokio::fs::create_dir_all(&dir).await?;
            let config = serde_json::to_vec(container)
                .map_err(|e| DaemonError::Failed(e.to_string()))?;
            tokio::fs::write(dir.join("config.json"), config).await?;
            tokio::fs::write(dir.join("hostconfig.json"), b"{}").await?;
        }
        Ok(())
    }
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
