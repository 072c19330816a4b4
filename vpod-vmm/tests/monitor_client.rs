//! Monitor client protocol tests against an in-process fake hypervisor
//! speaking the real wire format over a Unix socket.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use vpod_vmm::monitor::{Monitor, disk_add_session, netdev_add_session};
use vpod_vmm::vm::VmEvent;
use vpod_vmm::vm::events::BlockSource;

const WELCOME: &str = r#"{"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": []}}"#;

struct FakeMonitor {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl FakeMonitor {
    /// Connect to the daemon's listener and complete the handshake.
    async fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("connect monitor");
        let (rd, wr) = stream.into_split();
        let mut fake = Self {
            reader: BufReader::new(rd),
            writer: wr,
        };
        fake.send_raw(WELCOME).await;
        let caps = fake.read_command().await;
        assert_eq!(caps["execute"], "qmp_capabilities");
        fake.send_raw(r#"{"return": {}}"#).await;
        fake
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("fake monitor write");
    }

    async fn read_command(&mut self) -> Value {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .await
            .expect("fake monitor read");
        serde_json::from_str(&line).expect("command is json")
    }
}

fn start_client(dir: &tempfile::TempDir) -> (Monitor, mpsc::Receiver<VmEvent>, std::path::PathBuf) {
    let sock = dir.path().join("monitor.sock");
    let listener = UnixListener::bind(&sock).expect("bind monitor socket");
    let (hub_tx, hub_rx) = mpsc::channel(128);
    let monitor = Monitor::start(listener, hub_tx);
    (monitor, hub_rx, sock)
}

async fn next_event(hub: &mut mpsc::Receiver<VmEvent>) -> VmEvent {
    timeout(Duration::from_secs(10), hub.recv())
        .await
        .expect("event within deadline")
        .expect("hub open")
}

#[tokio::test]
async fn disk_session_runs_in_order_and_fires_callback() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    monitor
        .submit(disk_add_session(
            "c1",
            BlockSource::Image,
            "/dev/mapper/vpod-c1",
            "raw",
            0,
        ))
        .await;

    let drive = fake.read_command().await;
    assert_eq!(drive["execute"], "human-monitor-command");
    let line = drive["arguments"]["command-line"].as_str().unwrap();
    assert!(line.contains("file=/dev/mapper/vpod-c1"), "{line}");
    assert!(line.contains("id=scsi-disk0"), "{line}");
    fake.send_raw(r#"{"return": {}}"#).await;

    let device = fake.read_command().await;
    assert_eq!(device["execute"], "device_add");
    assert_eq!(device["arguments"]["driver"], "scsi-hd");
    assert_eq!(device["arguments"]["scsi-id"], 0);
    fake.send_raw(r#"{"return": {}}"#).await;

    match next_event(&mut hub).await {
        VmEvent::BlockdevInserted {
            name,
            guest_device,
            scsi_id,
            ..
        } => {
            assert_eq!(name, "c1");
            assert_eq!(guest_device, "sda");
            assert_eq!(scsi_id, 0);
        }
        other => panic!("expected BlockdevInserted, got {}", other.name()),
    }
}

#[tokio::test]
async fn failed_command_is_retried_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    monitor
        .submit(disk_add_session(
            "c1",
            BlockSource::Image,
            "/dev/mapper/vpod-c1",
            "raw",
            1,
        ))
        .await;

    let _drive = fake.read_command().await;
    fake.send_raw(r#"{"return": {}}"#).await;

    // First device_add fails; the client must resend the same command.
    let first = fake.read_command().await;
    assert_eq!(first["execute"], "device_add");
    fake.send_raw(r#"{"error": {"class": "GenericError", "desc": "try again"}}"#)
        .await;
    let second = fake.read_command().await;
    assert_eq!(second, first);
    fake.send_raw(r#"{"return": {}}"#).await;

    match next_event(&mut hub).await {
        VmEvent::BlockdevInserted { guest_device, .. } => assert_eq!(guest_device, "sdb"),
        other => panic!("expected BlockdevInserted, got {}", other.name()),
    }
}

#[tokio::test]
async fn exhausted_retries_fail_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    monitor
        .submit(disk_add_session(
            "c1",
            BlockSource::Image,
            "/dev/mapper/vpod-c1",
            "raw",
            0,
        ))
        .await;

    for _ in 0..3 {
        let cmd = fake.read_command().await;
        assert_eq!(cmd["execute"], "human-monitor-command");
        fake.send_raw(r#"{"error": {"class": "GenericError", "desc": "no such pool"}}"#)
            .await;
    }

    match next_event(&mut hub).await {
        VmEvent::DeviceFailed { cause } => assert!(cause.contains("no such pool"), "{cause}"),
        other => panic!("expected DeviceFailed, got {}", other.name()),
    }
}

#[tokio::test]
async fn netdev_session_carries_fd_and_events_flow_out_of_band() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    let tap = std::fs::File::open("/dev/null").unwrap();
    monitor
        .submit(netdev_add_session(tap.as_raw_fd(), "eth0", 0, 0x05))
        .await;

    let getfd = fake.read_command().await;
    assert_eq!(getfd["execute"], "getfd");
    assert_eq!(getfd["arguments"]["fdname"], "fdeth0");
    fake.send_raw(r#"{"return": {}}"#).await;

    // An async event interleaved with the session must not disturb it.
    fake.send_raw(r#"{"event": "RESUME", "timestamp": {"seconds": 1, "microseconds": 0}}"#)
        .await;

    let netdev = fake.read_command().await;
    assert_eq!(netdev["execute"], "netdev_add");
    assert_eq!(netdev["arguments"]["fd"], "fdeth0");
    fake.send_raw(r#"{"return": {}}"#).await;

    let device = fake.read_command().await;
    assert_eq!(device["execute"], "device_add");
    assert_eq!(device["arguments"]["driver"], "virtio-net-pci");
    assert_eq!(device["arguments"]["addr"], "0x5");
    fake.send_raw(r#"{"return": {}}"#).await;

    let mut saw_resume = false;
    let mut saw_inserted = false;
    for _ in 0..2 {
        match next_event(&mut hub).await {
            VmEvent::MonitorEvent(ev) => {
                assert_eq!(ev.name, "RESUME");
                saw_resume = true;
            }
            VmEvent::NetdevInserted {
                index,
                device,
                pci_addr,
            } => {
                assert_eq!(index, 0);
                assert_eq!(device, "eth0");
                assert_eq!(pci_addr, 0x05);
                saw_inserted = true;
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }
    assert!(saw_resume && saw_inserted);
}

#[tokio::test]
async fn shutdown_event_closes_client_and_fails_queued_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    fake.send_raw(r#"{"event": "SHUTDOWN", "timestamp": {"seconds": 2, "microseconds": 0}}"#)
        .await;

    match next_event(&mut hub).await {
        VmEvent::MonitorEvent(ev) => assert_eq!(ev.name, "SHUTDOWN"),
        other => panic!("expected shutdown event, got {}", other.name()),
    }

    monitor
        .submit(disk_add_session(
            "late",
            BlockSource::Image,
            "/dev/mapper/vpod-late",
            "raw",
            0,
        ))
        .await;

    match next_event(&mut hub).await {
        VmEvent::DeviceFailed { .. } => {}
        other => panic!("expected DeviceFailed, got {}", other.name()),
    }
}

#[tokio::test]
async fn sessions_are_serialized_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let (monitor, mut hub, sock) = start_client(&dir);
    let mut fake = FakeMonitor::connect(&sock).await;

    monitor
        .submit(disk_add_session(
            "a",
            BlockSource::Image,
            "/dev/mapper/vpod-a",
            "raw",
            0,
        ))
        .await;
    monitor
        .submit(disk_add_session(
            "b",
            BlockSource::Volume,
            "/dev/mapper/vpod-b",
            "raw",
            1,
        ))
        .await;

    // All four commands arrive strictly in session order.
    let mut files = Vec::new();
    for _ in 0..2 {
        let drive = fake.read_command().await;
        files.push(
            drive["arguments"]["command-line"]
                .as_str()
                .unwrap()
                .to_string(),
        );
        fake.send_raw(r#"{"return": {}}"#).await;
        let device = fake.read_command().await;
        assert_eq!(device["execute"], "device_add");
        fake.send_raw(r#"{"return": {}}"#).await;
    }
    assert!(files[0].contains("vpod-a"));
    assert!(files[1].contains("vpod-b"));

    let mut names = Vec::new();
    for _ in 0..2 {
        match next_event(&mut hub).await {
            VmEvent::BlockdevInserted { name, .. } => names.push(name),
            other => panic!("unexpected event {}", other.name()),
        }
    }
    assert_eq!(names, vec!["a", "b"]);
}
