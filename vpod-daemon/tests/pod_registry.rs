//! Registry behavior against a real sqlite store in a scratch state root.
//! VM bring-up is not exercised here; lifecycle events are injected the way
//! coordinators deliver them.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vpod_daemon::config::DaemonConfig;
use vpod_daemon::error::DaemonError;
use vpod_daemon::registry::{PodRegistry, PodStatus};
use vpod_daemon::store::{KvStore, keys};
use vpod_vmm::device::{BlockDevice, DeviceError, Provisioner, TapDevice};
use vpod_vmm::pod::UserPod;
use vpod_vmm::vm::VmLifecycle;

struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn image_device(&self, _: &str, _: &str) -> Result<BlockDevice, DeviceError> {
        unimplemented!("no vm in these tests")
    }

    async fn volume_device(&self, _: &str) -> Result<BlockDevice, DeviceError> {
        unimplemented!("no vm in these tests")
    }

    async fn remove_device(&self, _: &str) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn allocate_tap(&self, _: Option<Ipv4Addr>) -> Result<TapDevice, DeviceError> {
        unimplemented!("no vm in these tests")
    }

    fn release_address(&self, _: Ipv4Addr) {}

    async fn setup_share(&self, vm_root: &Path) -> Result<PathBuf, DeviceError> {
        Ok(vm_root.join("share_dir"))
    }

    async fn teardown_share(&self, _: &Path) {}
}

async fn registry_at(
    root: &Path,
) -> (Arc<PodRegistry>, mpsc::Receiver<VmLifecycle>, Arc<KvStore>) {
    let store = Arc::new(KvStore::open(root).await.unwrap());
    let config = Arc::new(DaemonConfig {
        state_root: root.to_path_buf(),
        ..DaemonConfig::default()
    });
    let (tx, rx) = mpsc::channel(16);
    let registry = Arc::new(PodRegistry::new(
        store.clone(),
        config,
        Arc::new(NoopProvisioner),
        tx,
    ));
    (registry, rx, store)
}

fn spec(id: &str) -> UserPod {
    serde_json::from_str(&format!(
        r#"{{"id":"{id}","containers":[{{"id":"{id}-c1","image":"img1","cmd":["/bin/true"]}}]}}"#
    ))
    .unwrap()
}

#[tokio::test]
async fn create_persists_record_and_container_configs() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx, store) = registry_at(dir.path()).await;

    let pod_id = registry.create_pod(spec("p1")).await.unwrap();
    assert_eq!(pod_id, "p1");

    let record = registry.lookup("p1").await.unwrap();
    assert_eq!(record.status, PodStatus::Pending);
    assert_eq!(record.containers, vec!["p1-c1"]);

    assert!(store.exists(&keys::pod("p1")).await.unwrap());
    assert_eq!(
        store.get(&keys::pod_container("p1")).await.unwrap().unwrap(),
        b"p1-c1"
    );
    assert!(dir.path().join("containers/p1-c1/config.json").exists());
    assert!(dir.path().join("containers/p1-c1/hostconfig.json").exists());

    // Ids are unique process-wide.
    match registry.create_pod(spec("p1")).await {
        Err(DaemonError::Busy(_)) => {}
        other => panic!("expected Busy, got {other:?}"),
    }
}

#[tokio::test]
async fn generated_pod_ids_are_unique() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx, _store) = registry_at(dir.path()).await;

    let mut anonymous = spec("x");
    anonymous.id = String::new();
    let a = registry.create_pod(anonymous.clone()).await.unwrap();
    let b = registry.create_pod(anonymous).await.unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with("pod-"));
}

#[tokio::test]
async fn lifecycle_events_drive_status_and_vm_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx, store) = registry_at(dir.path()).await;

    registry.create_pod(spec("p1")).await.unwrap();
    registry.associate_vm("p1", "vm-1", None).await.unwrap();
    assert_eq!(
        store.get(&keys::vm_by_pod("p1")).await.unwrap().unwrap(),
        b"vm-1"
    );

    let persist: vpod_vmm::vm::VmPersistInfo = serde_json::from_value(serde_json::json!({
        "id": "vm-1", "pod_id": "p1", "cpu": 1, "memory_mb": 128,
        "home_dir": "", "monitor_sock": "", "hyper_sock": "", "tty_sock": "",
        "share_dir": "", "pid": 1, "next_scsi_id": 1, "next_pci_addr": 5,
        "blockdevs": [], "netdevs": [], "serial_ports": []
    }))
    .unwrap();
    registry
        .handle_lifecycle(VmLifecycle::Running {
            pod_id: "p1".into(),
            vm_id: "vm-1".into(),
            persist: Box::new(persist),
        })
        .await;
    assert_eq!(
        registry.lookup("p1").await.unwrap().status,
        PodStatus::Running
    );
    assert!(store.exists(&keys::vm_data("vm-1")).await.unwrap());

    registry
        .handle_lifecycle(VmLifecycle::Stopped {
            pod_id: "p1".into(),
            vm_id: "vm-1".into(),
            reason: "hypervisor exit".into(),
        })
        .await;
    let record = registry.lookup("p1").await.unwrap();
    assert_eq!(record.status, PodStatus::Stopped);
    assert_eq!(record.vm_id, None);
    assert!(!store.exists(&keys::vm_data("vm-1")).await.unwrap());
    assert!(!store.exists(&keys::vm_by_pod("p1")).await.unwrap());
}

#[tokio::test]
async fn restart_recovery_marks_dead_vms_stopped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (registry, _rx, store) = registry_at(dir.path()).await;
        registry.create_pod(spec("p1")).await.unwrap();
        registry.associate_vm("p1", "vm-1", None).await.unwrap();
        // A running record whose pid cannot exist anymore.
        let persist = serde_json::json!({
            "id": "vm-1", "pod_id": "p1", "cpu": 1, "memory_mb": 128,
            "home_dir": "", "monitor_sock": "", "hyper_sock": "", "tty_sock": "",
            "share_dir": "", "pid": 999999999, "next_scsi_id": 1, "next_pci_addr": 5,
            "blockdevs": [], "netdevs": [], "serial_ports": []
        });
        store
            .put(
                &keys::vm_data("vm-1"),
                persist.to_string().as_bytes(),
            )
            .await
            .unwrap();
        registry.set_status("p1", PodStatus::Running).await;
    }

    let (registry, _rx, store) = registry_at(dir.path()).await;
    registry.recover().await.unwrap();

    let record = registry.lookup("p1").await.unwrap();
    assert_eq!(record.status, PodStatus::Stopped);
    assert_eq!(record.vm_id, None);
    assert!(!store.exists(&keys::vm_data("vm-1")).await.unwrap());

    // The listing reflects the recovered pod.
    let pods = registry.list_pods().await;
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].id, "p1");
}

#[tokio::test]
async fn operations_on_unknown_pods_say_so() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx, _store) = registry_at(dir.path()).await;

    match registry.stop_pod("ghost").await {
        Err(DaemonError::NoSuchPod(id)) => assert_eq!(id, "ghost"),
        other => panic!("expected NoSuchPod, got {other:?}"),
    }
    match registry.start_pod("ghost").await {
        Err(DaemonError::NoSuchPod(_)) => {}
        other => panic!("expected NoSuchPod, got {other:?}"),
    }
    match registry.delete_pod("ghost").await {
        Err(DaemonError::NoSuchPod(_)) => {}
        other => panic!("expected NoSuchPod, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_removes_map_entry_and_keys() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx, store) = registry_at(dir.path()).await;

    registry.create_pod(spec("p1")).await.unwrap();
    registry.delete_pod("p1").await.unwrap();
    assert!(registry.lookup("p1").await.is_none());
    assert!(!store.exists(&keys::pod("p1")).await.unwrap());
    assert!(!store.exists(&keys::pod_container("p1")).await.unwrap());
}
