//! The closed event union consumed by the VM coordinator.
//!
//! Every task working for a VM (monitor client, guest channel, device
//! preparation, process waiter, timers) reports back by posting one of these
//! on the coordinator's hub channel. The coordinator is the only reader.

use std::fmt;

use tokio::sync::oneshot;

use crate::channel::GuestOp;
use crate::device::{BlockDevice, TapDevice};
use crate::error::VmError;
use crate::monitor::MonEvent;
use crate::pod::UserPod;

/// Responder handed back to the caller of a coordinator request.
pub type VmReply = oneshot::Sender<Result<(), VmError>>;

/// Origin of a hot-plugged block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Image,
    Volume,
}

impl fmt::Display for BlockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSource::Image => write!(f, "image"),
            BlockSource::Volume => write!(f, "volume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Init,
    Migrate,
}

pub enum VmEvent {
    /// Internal request to end the coordinator loop without cleanup.
    Quit,
    /// The hypervisor child process exited.
    HypervisorExit { status: i32 },
    /// Asynchronous event frame from the monitor.
    MonitorEvent(MonEvent),
    /// The guest init completed its READY handshake; the channel is live.
    InitConnected,
    /// Monitor or channel bring-up failed; `reason` is human-readable.
    InitFailed { reason: String },
    /// Caller command: run this pod in the VM.
    RunPod { spec: Box<UserPod>, reply: VmReply },
    /// Device preparation finished for a container image.
    ContainerCreated {
        index: usize,
        id: String,
        device: BlockDevice,
    },
    /// Device preparation finished for a pod volume.
    VolumeReady { name: String, device: BlockDevice },
    /// The monitor acknowledged a SCSI disk hot-plug.
    BlockdevInserted {
        name: String,
        source: BlockSource,
        guest_device: String,
        scsi_id: u32,
    },
    /// Device preparation finished for a network interface.
    InterfaceCreated { index: usize, tap: TapDevice },
    /// The monitor acknowledged a virtio-net hot-plug.
    NetdevInserted {
        index: usize,
        device: String,
        pci_addr: u32,
    },
    /// The monitor acknowledged a serial port hot-plug.
    SerialAdded { index: usize, port: String },
    /// A monitor session failed after retries, or a device task failed.
    DeviceFailed { cause: String },
    /// The guest channel hit a fatal framing or transport error.
    ChannelError { cause: String },
    /// A one-shot timer fired.
    Timeout(TimeoutKind),
    /// The guest acknowledged the request with the given opcode.
    Ack { op: GuestOp, msg: Vec<u8> },
    /// The guest rejected the request with the given opcode.
    GuestError { op: GuestOp, message: String },
    /// Caller command: stop the pod and shut the VM down.
    StopPod { reply: VmReply },
    /// Caller command: migrate VM memory to a peer daemon.
    Migrate {
        host: String,
        port: u16,
        reply: VmReply,
    },
    /// Caller command: resume a VM paused by a failed migration.
    Resume { reply: VmReply },
    /// The monitor `migrate` session completed.
    MigrateComplete,
    /// The monitor `cont` session completed.
    ResumeComplete,
}

impl VmEvent {
    /// Short name for logging; events carry responders and fds, so no Debug.
    pub fn name(&self) -> &'static str {
        match self {
            VmEvent::Quit => "Quit",
            VmEvent::HypervisorExit { .. } => "HypervisorExit",
            VmEvent::MonitorEvent(_) => "MonitorEvent",
            VmEvent::InitConnected => "InitConnected",
            VmEvent::InitFailed { .. } => "InitFailed",
            VmEvent::RunPod { .. } => "RunPod",
            VmEvent::ContainerCreated { .. } => "ContainerCreated",
            VmEvent::VolumeReady { .. } => "VolumeReady",
            VmEvent::BlockdevInserted { .. } => "BlockdevInserted",
            VmEvent::InterfaceCreated { .. } => "InterfaceCreated",
            VmEvent::NetdevInserted { .. } => "NetdevInserted",
            VmEvent::SerialAdded { .. } => "SerialAdded",
            VmEvent::DeviceFailed { .. } => "DeviceFailed",
            VmEvent::ChannelError { .. } => "ChannelError",
            VmEvent::Timeout(_) => "Timeout",
            VmEvent::Ack { .. } => "Ack",
            VmEvent::GuestError { .. } => "GuestError",
            VmEvent::StopPod { .. } => "StopPod",
            VmEvent::Migrate { .. } => "Migrate",
            VmEvent::Resume { .. } => "Resume",
            VmEvent::MigrateComplete => "MigrateComplete",
            VmEvent::ResumeComplete => "ResumeComplete",
        }
    }
}
