//! Coordinator state-machine tests: a fake hypervisor process, a fake
//! monitor and a fake guest init drive a VM from spawn to RUNNING to
//! cleanup over the real wire protocols.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vpod_vmm::channel::{GuestOp, read_frame, write_frame};
use vpod_vmm::device::{BlockDevice, DeviceMetadata, Provisioner, TapDevice};
use vpod_vmm::error::{DeviceError, VmError};
use vpod_vmm::hypervisor::{VmBootConfig, VmPaths};
use vpod_vmm::pod::UserPod;
use vpod_vmm::vm::{VmLifecycle, VmOptions, VmTimeouts, start_vm};

struct FakeProvisioner {
    seq: AtomicU32,
    next_ip: AtomicU32,
    removed: Mutex<Vec<String>>,
    released: Mutex<Vec<Ipv4Addr>>,
    shares_torn: Mutex<Vec<PathBuf>>,
}

impl FakeProvisioner {
    fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            next_ip: AtomicU32::new(2),
            removed: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            shares_torn: Mutex::new(Vec::new()),
        }
    }

    fn fake_device(&self, name: &str) -> BlockDevice {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        BlockDevice {
            name: name.to_string(),
            path: PathBuf::from(format!("/dev/fake/{name}")),
            format: "raw".to_string(),
            fstype: "ext4".to_string(),
            metadata: DeviceMetadata {
                device_id: id,
                device_size: 1 << 30,
                transaction_id: u64::from(id),
            },
        }
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn image_device(
        &self,
        container_id: &str,
        _image: &str,
    ) -> Result<BlockDevice, DeviceError> {
        Ok(self.fake_device(container_id))
    }

    async fn volume_device(&self, name: &str) -> Result<BlockDevice, DeviceError> {
        Ok(self.fake_device(name))
    }

    async fn remove_device(&self, id: &str) -> Result<(), DeviceError> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn allocate_tap(&self, _requested: Option<Ipv4Addr>) -> Result<TapDevice, DeviceError> {
        let host = self.next_ip.fetch_add(1, Ordering::SeqCst);
        Ok(TapDevice {
            file: std::fs::File::open("/dev/null").unwrap(),
            name: format!("tap{host}"),
            ip: Ipv4Addr::new(10, 11, 0, host as u8),
            prefix_len: 16,
            gateway: Ipv4Addr::new(10, 11, 0, 1),
        })
    }

    fn release_address(&self, ip: Ipv4Addr) {
        self.released.lock().unwrap().push(ip);
    }

    async fn setup_share(&self, vm_root: &Path) -> Result<PathBuf, DeviceError> {
        let share = vm_root.join("share_dir");
        tokio::fs::create_dir_all(&share).await?;
        Ok(share)
    }

    async fn teardown_share(&self, share_dir: &Path) {
        self.shares_torn.lock().unwrap().push(share_dir.to_path_buf());
        let _ = tokio::fs::remove_dir_all(share_dir).await;
    }
}

fn fake_boot(dir: &Path) -> VmBootConfig {
    let script = dir.join("fake-hypervisor.sh");
    std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    VmBootConfig {
        hypervisor: script,
        kernel: PathBuf::from("/dev/null"),
        initrd: PathBuf::from("/dev/null"),
        cpu: 1,
        memory_mb: 128,
    }
}

/// Server side of the monitor dialog: greet, answer every command with
/// success, emit SHUTDOWN after `quit`.
fn spawn_fake_qemu(sock: PathBuf) {
    tokio::spawn(async move {
        let Ok(stream) = UnixStream::connect(&sock).await else {
            return;
        };
        let (rd, mut wr) = stream.into_split();
        let mut reader = BufReader::new(rd);
        let welcome = r#"{"QMP": {"version": {}, "capabilities": []}}"#;
        if wr.write_all(format!("{welcome}\n").as_bytes()).await.is_err() {
            return;
        }
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let Ok(cmd) = serde_json::from_str::<Value>(&line) else {
                return;
            };
            if wr.write_all(b"{\"return\": {}}\n").await.is_err() {
                return;
            }
            if cmd["execute"] == "quit" {
                let shutdown = r#"{"event": "SHUTDOWN", "timestamp": {"seconds": 0, "microseconds": 0}}"#;
                let _ = wr.write_all(format!("{shutdown}\n").as_bytes()).await;
                return;
            }
        }
    });
}

/// Client side of the guest channel: READY, then ACK every request,
/// reporting each received frame to the test.
fn spawn_fake_init(sock: PathBuf, frames: mpsc::UnboundedSender<(u32, Vec<u8>)>) {
    tokio::spawn(async move {
        let Ok(mut stream) = UnixStream::connect(&sock).await else {
            return;
        };
        if write_frame(&mut stream, GuestOp::Ready, &[]).await.is_err() {
            return;
        }
        loop {
            let (code, payload) = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            let _ = frames.send((code, payload));
            if write_frame(&mut stream, GuestOp::Ack, &[]).await.is_err() {
                return;
            }
        }
    });
}

fn options(dir: &Path, vm_id: &str, pod_id: &str, init_timeout: Duration) -> VmOptions {
    VmOptions {
        vm_id: vm_id.to_string(),
        pod_id: pod_id.to_string(),
        base_dir: dir.to_path_buf(),
        boot: fake_boot(dir),
        timeouts: VmTimeouts {
            init: init_timeout,
            migrate: Duration::from_secs(5),
        },
        incoming_port: None,
        extra_args: Vec::new(),
        restore: None,
    }
}

async fn recv_lifecycle(rx: &mut mpsc::Receiver<VmLifecycle>) -> VmLifecycle {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("lifecycle event within deadline")
        .expect("lifecycle channel open")
}

#[tokio::test]
async fn minimal_pod_start_reaches_running_then_stops_clean() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = std::sync::Arc::new(FakeProvisioner::new());
    let (lc_tx, mut lc_rx) = mpsc::channel(16);

    let handle = start_vm(
        options(dir.path(), "vm-1", "pod-1", Duration::from_secs(10)),
        provisioner.clone(),
        lc_tx,
    )
    .await
    .expect("vm starts");

    let paths = VmPaths::new(dir.path(), "vm-1");
    spawn_fake_qemu(paths.monitor_socket());
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    spawn_fake_init(paths.hyper_socket(), frames_tx);

    let spec: UserPod = serde_json::from_str(
        r#"{"containers":[{"id":"c1","image":"img1","cmd":["/bin/echo","hi"]}]}"#,
    )
    .unwrap();
    handle.run_pod(spec).await.expect("pod runs");

    match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Running {
            pod_id,
            vm_id,
            persist,
        } => {
            assert_eq!(pod_id, "pod-1");
            assert_eq!(vm_id, "vm-1");
            assert_eq!(persist.blockdevs.len(), 1);
            assert_eq!(persist.blockdevs[0].scsi_id, 0);
            assert_eq!(persist.blockdevs[0].guest_device, "sda");
            assert_eq!(persist.next_scsi_id, 1);
        }
        VmLifecycle::Stopped { reason, .. } => panic!("vm stopped early: {reason}"),
    }

    let (code, payload) = frames_rx.recv().await.expect("start_pod frame");
    assert_eq!(code, GuestOp::StartPod.code());
    let descriptor: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(descriptor["containers"][0]["id"], "c1");
    assert_eq!(descriptor["containers"][0]["rootfs"], "sda");
    assert_eq!(descriptor["shareDir"], "share_dir");
    assert_eq!(descriptor["containers"][0]["cmd"][0], "/bin/echo");

    handle.stop().await.expect("stop succeeds");
    match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Stopped { vm_id, .. } => assert_eq!(vm_id, "vm-1"),
        VmLifecycle::Running { .. } => panic!("unexpected running event"),
    }

    let (code, _) = frames_rx.recv().await.expect("stop_pod frame");
    assert_eq!(code, GuestOp::StopPod.code());

    assert!(provisioner.removed.lock().unwrap().contains(&"c1".to_string()));
    assert_eq!(provisioner.shares_torn.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn multi_device_pod_sends_single_start_pod() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = std::sync::Arc::new(FakeProvisioner::new());
    let (lc_tx, mut lc_rx) = mpsc::channel(16);

    let handle = start_vm(
        options(dir.path(), "vm-2", "pod-2", Duration::from_secs(10)),
        provisioner.clone(),
        lc_tx,
    )
    .await
    .expect("vm starts");

    let paths = VmPaths::new(dir.path(), "vm-2");
    spawn_fake_qemu(paths.monitor_socket());
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    spawn_fake_init(paths.hyper_socket(), frames_tx);

    let spec: UserPod = serde_json::from_str(
        r#"{
            "containers": [
                {"id": "c1", "image": "img1", "volumes": [{"volume": "v1", "mount": "/data"}]},
                {"id": "c2", "image": "img2"}
            ],
            "volumes": [{"name": "v1"}],
            "interfaces": [{}]
        }"#,
    )
    .unwrap();
    handle.run_pod(spec).await.expect("pod runs");

    let persist = match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Running { persist, .. } => persist,
        VmLifecycle::Stopped { reason, .. } => panic!("vm stopped early: {reason}"),
    };

    assert_eq!(persist.blockdevs.len(), 3);
    let mut scsi_ids: Vec<u32> = persist.blockdevs.iter().map(|b| b.scsi_id).collect();
    scsi_ids.sort_unstable();
    assert_eq!(scsi_ids, vec![0, 1, 2]);
    let mut guests: Vec<&str> = persist
        .blockdevs
        .iter()
        .map(|b| b.guest_device.as_str())
        .collect();
    guests.sort_unstable();
    assert_eq!(guests, vec!["sda", "sdb", "sdc"]);
    assert_eq!(persist.netdevs.len(), 1);
    assert_eq!(persist.netdevs[0].pci_addr, 0x05);
    assert_eq!(persist.next_scsi_id, 3);
    assert_eq!(persist.next_pci_addr, 0x06);

    handle.stop().await.expect("stop succeeds");
    match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Stopped { .. } => {}
        VmLifecycle::Running { .. } => panic!("unexpected running event"),
    }

    // Exactly one START_POD across the whole run.
    let mut start_pods = 0;
    while let Ok(frame) = frames_rx.try_recv() {
        if frame.0 == GuestOp::StartPod.code() {
            start_pods += 1;
        }
    }
    assert_eq!(start_pods, 1);

    // The tap address went back to the allocator.
    assert_eq!(
        provisioner.released.lock().unwrap().as_slice(),
        &[Ipv4Addr::new(10, 11, 0, 2)]
    );
}

#[tokio::test]
async fn init_timeout_forces_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = std::sync::Arc::new(FakeProvisioner::new());
    let (lc_tx, mut lc_rx) = mpsc::channel(16);

    let handle = start_vm(
        options(dir.path(), "vm-3", "pod-3", Duration::from_millis(300)),
        provisioner.clone(),
        lc_tx,
    )
    .await
    .expect("vm starts");

    // No fake init ever connects; the READY deadline must fire.
    let spec: UserPod =
        serde_json::from_str(r#"{"containers":[{"id":"c1","image":"img1"}]}"#).unwrap();
    match handle.run_pod(spec).await {
        Err(VmError::InitTimeout) => {}
        Err(other) => panic!("expected init timeout, got {other}"),
        Ok(()) => panic!("pod unexpectedly started"),
    }

    match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Stopped { reason, .. } => {
            assert!(reason.contains("init timeout"), "{reason}")
        }
        VmLifecycle::Running { .. } => panic!("unexpected running event"),
    }

    assert_eq!(provisioner.shares_torn.lock().unwrap().len(), 1);
    assert!(provisioner.removed.lock().unwrap().contains(&"c1".to_string()));
}

#[tokio::test]
async fn stop_while_preparing_reaches_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = std::sync::Arc::new(FakeProvisioner::new());
    let (lc_tx, mut lc_rx) = mpsc::channel(16);

    let handle = start_vm(
        options(dir.path(), "vm-4", "pod-4", Duration::from_secs(10)),
        provisioner.clone(),
        lc_tx,
    )
    .await
    .expect("vm starts");

    let paths = VmPaths::new(dir.path(), "vm-4");
    spawn_fake_qemu(paths.monitor_socket());
    // No guest init: the pod can never reach RUNNING, so the VM sits in
    // PREPARING until the stop arrives.

    let spec: UserPod =
        serde_json::from_str(r#"{"containers":[{"id":"c1","image":"img1"}]}"#).unwrap();
    let runner = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.run_pod(spec).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop().await.expect("stop succeeds");

    match recv_lifecycle(&mut lc_rx).await {
        VmLifecycle::Stopped { .. } => {}
        VmLifecycle::Running { .. } => panic!("unexpected running event"),
    }
    assert!(runner.await.unwrap().is_err());
    assert_eq!(provisioner.shares_torn.lock().unwrap().len(), 1);
}
