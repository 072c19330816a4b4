//! Monitor wire protocol: newline-delimited JSON frames and the session
//! builders the coordinator submits.

use std::os::unix::io::RawFd;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::MonitorError;
use crate::vm::events::{BlockSource, VmEvent};

pub const EVENT_SHUTDOWN: &str = "SHUTDOWN";
pub const EVENT_RESET: &str = "RESET";
pub const EVENT_STOP: &str = "STOP";
pub const EVENT_RESUME: &str = "RESUME";

/// An outgoing `{"execute": ..., "arguments": ...}` frame.
#[derive(Debug, Clone, Serialize)]
pub struct MonRequest {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl MonRequest {
    pub fn new(execute: &str, arguments: Value) -> Self {
        Self {
            execute: execute.to_string(),
            arguments: Some(arguments),
        }
    }

    pub fn bare(execute: &str) -> Self {
        Self {
            execute: execute.to_string(),
            arguments: None,
        }
    }
}

/// A request plus the file descriptor that must travel with it as ancillary
/// data, if any. The fd is borrowed; the coordinator keeps ownership until
/// cleanup.
pub struct MonCommand {
    pub request: MonRequest,
    pub fd: Option<RawFd>,
}

impl MonCommand {
    pub fn plain(request: MonRequest) -> Self {
        Self { request, fd: None }
    }
}

/// An asynchronous event frame.
#[derive(Debug, Clone)]
pub struct MonEvent {
    pub name: String,
    pub seconds: u64,
    pub microseconds: u64,
    pub data: Option<Value>,
}

/// Decoded incoming frame, dispatched on the top-level key.
pub(crate) enum MonMessage {
    /// The greeting banner (`{"QMP": ...}`) sent once after connect.
    Welcome(Value),
    Return(Value),
    Error { class: String, desc: String },
    Event(MonEvent),
}

pub(crate) fn decode_message(line: &str) -> Result<MonMessage, MonitorError> {
    let v: Value = serde_json::from_str(line)
        .map_err(|e| MonitorError::Protocol(format!("bad frame {line:?}: {e}")))?;
    if let Some(name) = v.get("event").and_then(Value::as_str) {
        let seconds = v
            .pointer("/timestamp/seconds")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let microseconds = v
            .pointer("/timestamp/microseconds")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        return Ok(MonMessage::Event(MonEvent {
            name: name.to_string(),
            seconds,
            microseconds,
            data: v.get("data").cloned(),
        }));
    }
    if let Some(ret) = v.get("return") {
        return Ok(MonMessage::Return(ret.clone()));
    }
    if let Some(err) = v.get("error") {
        let class = err
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string();
        let desc = err
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown monitor error")
            .to_string();
        return Ok(MonMessage::Error { class, desc });
    }
    if let Some(banner) = v.get("QMP") {
        return Ok(MonMessage::Welcome(banner.clone()));
    }
    Err(MonitorError::Protocol(format!(
        "frame has no recognizable key: {line}"
    )))
}

/// An ordered group of commands with a single success callback. The callback
/// event fires exactly once: `done` on success, DeviceFailed with the first
/// error otherwise.
pub struct MonSession {
    pub commands: Vec<MonCommand>,
    pub done: Option<VmEvent>,
}

/// Guest-visible SCSI device name for a SCSI id: "sda".."sdz", "sdaa"..
pub fn scsi_device_name(id: u32) -> String {
    fn encode(id: u32, out: &mut String) {
        if id >= 26 {
            encode(id / 26 - 1, out);
        }
        out.push((b'a' + (id % 26) as u8) as char);
    }
    let mut name = String::from("sd");
    encode(id, &mut name);
    name
}

/// Inverse of [`scsi_device_name`].
pub fn scsi_device_id(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix("sd")?;
    if suffix.is_empty() {
        return None;
    }
    let mut id: u64 = 0;
    for (i, c) in suffix.bytes().enumerate() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        let digit = (c - b'a') as u64;
        if i == 0 {
            id = digit;
        } else {
            id = (id + 1) * 26 + digit;
        }
    }
    u32::try_from(id).ok()
}

/// Hot-plug one SCSI disk: a drive through the human monitor, then the
/// scsi-hd device on the shared virtio-scsi bus.
pub fn disk_add_session(
    name: &str,
    source: BlockSource,
    filename: &str,
    format: &str,
    scsi_id: u32,
) -> MonSession {
    let drive_id = format!("scsi-disk{scsi_id}");
    let commands = vec![
        MonCommand::plain(MonRequest::new(
            "human-monitor-command",
            json!({
                "command-line": format!(
                    "drive_add dummy file={filename},if=none,id={drive_id},format={format},cache=writeback"
                ),
            }),
        )),
        MonCommand::plain(MonRequest::new(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "bus": "scsi0.0",
                "scsi-id": scsi_id,
                "drive": drive_id,
                "id": drive_id,
            }),
        )),
    ];
    MonSession {
        commands,
        done: Some(VmEvent::BlockdevInserted {
            name: name.to_string(),
            source,
            guest_device: scsi_device_name(scsi_id),
            scsi_id,
        }),
    }
}

/// Hot-plug one tap-backed NIC. The tap fd rides as ancillary data on the
/// same write as the `getfd` frame; the follow-up commands reference it by
/// the registered name.
pub fn netdev_add_session(fd: RawFd, device: &str, index: usize, pci_addr: u32) -> MonSession {
    let fd_name = format!("fd{device}");
    let commands = vec![
        MonCommand {
            request: MonRequest::new("getfd", json!({ "fdname": fd_name })),
            fd: Some(fd),
        },
        MonCommand::plain(MonRequest::new(
            "netdev_add",
            json!({ "type": "tap", "id": device, "fd": fd_name }),
        )),
        MonCommand::plain(MonRequest::new(
            "device_add",
            json!({
                "driver": "virtio-net-pci",
                "netdev": device,
                "bus": "pci.0",
                "addr": format!("{pci_addr:#x}"),
                "id": device,
            }),
        )),
    ];
    MonSession {
        commands,
        done: Some(VmEvent::NetdevInserted {
            index,
            device: device.to_string(),
            pci_addr,
        }),
    }
}

/// Hot-plug one virtio-serial port backed by a host Unix socket.
pub fn serial_add_session(socket_path: &str, index: usize) -> MonSession {
    let chardev_id = format!("podserial{index}");
    let port_name = format!("io.vpod.serial.{index}");
    let commands = vec![
        MonCommand::plain(MonRequest::new(
            "chardev-add",
            json!({
                "id": chardev_id,
                "backend": {
                    "type": "socket",
                    "data": {
                        "addr": { "type": "unix", "data": { "path": socket_path } },
                        "server": false,
                    },
                },
            }),
        )),
        MonCommand::plain(MonRequest::new(
            "device_add",
            json!({
                "driver": "virtserialport",
                "bus": "virtio-serial0.0",
                "nr": 2 + index,
                "chardev": chardev_id,
                "id": format!("serial{index}"),
                "name": port_name,
            }),
        )),
    ];
    MonSession {
        commands,
        done: Some(VmEvent::SerialAdded {
            index,
            port: port_name,
        }),
    }
}

pub fn quit_session() -> MonSession {
    MonSession {
        commands: vec![MonCommand::plain(MonRequest::new("quit", json!({})))],
        done: None,
    }
}

pub fn migrate_session(host: &str, port: u16) -> MonSession {
    MonSession {
        commands: vec![MonCommand::plain(MonRequest::new(
            "migrate",
            json!({ "uri": format!("tcp:{host}:{port}") }),
        ))],
        done: Some(VmEvent::MigrateComplete),
    }
}

pub fn cont_session() -> MonSession {
    MonSession {
        commands: vec![MonCommand::plain(MonRequest::new("cont", json!({})))],
        done: Some(VmEvent::ResumeComplete),
    }
}
