//! The per-VM state machine.
//!
//! One coordinator task per VM drives it from "process spawned" to "pod
//! running" to "shut down", joining the monitor dialog, the guest channel
//! and device preparation through the hub channel. Failures at any step
//! unwind through cleanup, which releases every host resource the VM
//! acquired.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{GuestChannel, GuestOp};
use crate::device::Provisioner;
use crate::error::VmError;
use crate::monitor::{
    self, EVENT_SHUTDOWN, Monitor, cont_session, disk_add_session, migrate_session,
    netdev_add_session, quit_session,
};
use crate::pod::UserPod;
use crate::vm::VmLifecycle;
use crate::vm::context::{BlockDev, NetDev, VmContext};
use crate::vm::events::{BlockSource, TimeoutKind, VmEvent, VmReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmState {
    Init,
    Preparing,
    Running,
    Stopping,
    Cleanup,
}

#[derive(Debug, Clone)]
pub struct VmTimeouts {
    /// Deadline for the guest's READY handshake.
    pub init: Duration,
    /// Deadline for a memory-copy migration.
    pub migrate: Duration,
}

impl Default for VmTimeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(30),
            migrate: Duration::from_secs(120),
        }
    }
}

pub(crate) struct Coordinator {
    ctx: VmContext,
    state: VmState,
    hub_rx: mpsc::Receiver<VmEvent>,
    hub_tx: mpsc::Sender<VmEvent>,
    monitor: Monitor,
    channel: GuestChannel,
    provisioner: Arc<dyn Provisioner>,
    lifecycle: mpsc::Sender<VmLifecycle>,
    timeouts: VmTimeouts,
    init_ready: bool,
    start_pod_sent: bool,
    stop_requested: bool,
    fail_reason: Option<String>,
    run_reply: Option<VmReply>,
    stop_replies: Vec<VmReply>,
    migrate_reply: Option<VmReply>,
    resume_reply: Option<VmReply>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: VmContext,
        restored: bool,
        hub_rx: mpsc::Receiver<VmEvent>,
        hub_tx: mpsc::Sender<VmEvent>,
        monitor: Monitor,
        channel: GuestChannel,
        provisioner: Arc<dyn Provisioner>,
        lifecycle: mpsc::Sender<VmLifecycle>,
        timeouts: VmTimeouts,
    ) -> Self {
        Self {
            ctx,
            state: if restored {
                VmState::Running
            } else {
                VmState::Init
            },
            hub_rx,
            hub_tx,
            monitor,
            channel,
            provisioner,
            lifecycle,
            timeouts,
            init_ready: false,
            start_pod_sent: restored,
            stop_requested: false,
            fail_reason: None,
            run_reply: None,
            stop_replies: Vec::new(),
            migrate_reply: None,
            resume_reply: None,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.state == VmState::Init {
            arm_timer(self.hub_tx.clone(), TimeoutKind::Init, self.timeouts.init);
        }

        loop {
            let Some(event) = self.hub_rx.recv().await else {
                break;
            };
            debug!(vm = %self.ctx.id, state = ?self.state, event = event.name(), "vm event");
            let Some(event) = self.handle_common(event).await else {
                if self.state == VmState::Cleanup {
                    break;
                }
                continue;
            };
            match self.state {
                VmState::Init => self.handle_init(event).await,
                VmState::Preparing => self.handle_preparing(event).await,
                VmState::Running => self.handle_running(event).await,
                VmState::Stopping => self.handle_stopping(event),
                VmState::Cleanup => {}
            }
            if self.state == VmState::Cleanup {
                break;
            }
        }

        self.cleanup().await;
    }

    /// Events whose handling does not depend on the current state. Returns
    /// the event back when the per-state handler should see it.
    async fn handle_common(&mut self, event: VmEvent) -> Option<VmEvent> {
        match event {
            VmEvent::Quit => {
                self.enter_cleanup("terminated");
                None
            }
            VmEvent::HypervisorExit { status } => {
                self.ctx.pid = None;
                match self.state {
                    VmState::Init | VmState::Preparing => {
                        self.fail_run(VmError::Failed(format!(
                            "hypervisor exited with status {status}"
                        )));
                        self.enter_cleanup(&format!("hypervisor exited with status {status}"));
                    }
                    _ => self.enter_cleanup("hypervisor exit"),
                }
                None
            }
            VmEvent::MonitorEvent(ev) => {
                if ev.name == EVENT_SHUTDOWN {
                    match self.state {
                        VmState::Init | VmState::Preparing => {
                            self.fail_run(VmError::Shutdown);
                        }
                        _ => {}
                    }
                    self.enter_cleanup("vm shutdown");
                } else {
                    debug!(vm = %self.ctx.id, event = %ev.name, "monitor event ignored");
                }
                None
            }
            VmEvent::ChannelError { cause } => {
                self.fail_run(VmError::Failed(cause.clone()));
                self.enter_cleanup(&format!("guest channel: {cause}"));
                None
            }
            VmEvent::InitFailed { reason } => {
                self.fail_run(VmError::Failed(reason.clone()));
                self.enter_cleanup(&reason);
                None
            }
            VmEvent::Timeout(TimeoutKind::Init) => {
                if !self.init_ready
                    && matches!(self.state, VmState::Init | VmState::Preparing)
                {
                    self.fail_run(VmError::InitTimeout);
                    self.enter_cleanup("init timeout");
                }
                None
            }
            VmEvent::Timeout(TimeoutKind::Migrate) => {
                if let Some(reply) = self.migrate_reply.take() {
                    warn!(vm = %self.ctx.id, "migration timed out");
                    let _ = reply.send(Err(VmError::MigrateTimeout));
                }
                None
            }
            VmEvent::StopPod { reply } => {
                self.stop_replies.push(reply);
                match self.state {
                    VmState::Running => {
                        if !self.stop_requested {
                            self.stop_requested = true;
                            self.channel.request(GuestOp::StopPod, b"{}".to_vec());
                        }
                    }
                    VmState::Stopping => {}
                    _ => {
                        self.fail_run(VmError::Shutdown);
                        self.enter_cleanup("stopped");
                    }
                }
                None
            }
            other => Some(other),
        }
    }

    async fn handle_init(&mut self, event: VmEvent) {
        match event {
            VmEvent::RunPod { spec, reply } => {
                if self.run_reply.is_some() {
                    let _ = reply.send(Err(VmError::Busy));
                    return;
                }
                info!(vm = %self.ctx.id, "pod spec received, preparing devices");
                self.run_reply = Some(reply);
                self.prepare_devices(*spec);
                self.state = VmState::Preparing;
            }
            VmEvent::InitConnected => {
                self.init_ready = true;
            }
            VmEvent::Migrate { reply, .. } | VmEvent::Resume { reply } => {
                let _ = reply.send(Err(VmError::Busy));
            }
            other => debug!(vm = %self.ctx.id, event = other.name(), "ignored in init"),
        }
    }

    async fn handle_preparing(&mut self, event: VmEvent) {
        match event {
            VmEvent::InitConnected => {
                self.init_ready = true;
                self.maybe_start_pod().await;
            }
            VmEvent::ContainerCreated { index, id, device } => {
                debug!(vm = %self.ctx.id, container = %id, index, "container device ready");
                self.attach_blockdev(id, BlockSource::Image, device).await;
            }
            VmEvent::VolumeReady { name, device } => {
                debug!(vm = %self.ctx.id, volume = %name, "volume device ready");
                self.attach_blockdev(name, BlockSource::Volume, device).await;
            }
            VmEvent::BlockdevInserted {
                name,
                source,
                guest_device,
                scsi_id,
            } => {
                if !self.ctx.progress.block_inserted(&name) {
                    warn!(vm = %self.ctx.id, device = %name, "unexpected blockdev insertion");
                    return;
                }
                info!(vm = %self.ctx.id, device = %name, %source, guest = %guest_device, scsi_id, "blockdev inserted");
                self.maybe_start_pod().await;
            }
            VmEvent::InterfaceCreated { index, tap } => {
                let pci_addr = self.ctx.next_pci_addr();
                let device = format!("eth{index}");
                let fd = {
                    use std::os::unix::io::AsRawFd;
                    tap.file.as_raw_fd()
                };
                let ports = self
                    .ctx
                    .spec
                    .as_ref()
                    .map(|s| {
                        s.containers
                            .iter()
                            .flat_map(|c| c.ports.iter().cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                self.ctx.progress.net_adding(index);
                self.ctx.netdevs.insert(
                    index,
                    NetDev {
                        index,
                        device: device.clone(),
                        tap_name: tap.name.clone(),
                        ip: tap.ip,
                        prefix_len: tap.prefix_len,
                        gateway: tap.gateway,
                        pci_addr,
                        ports,
                        file: tap.file,
                    },
                );
                self.monitor
                    .submit(netdev_add_session(fd, &device, index, pci_addr))
                    .await;
            }
            VmEvent::NetdevInserted {
                index,
                device,
                pci_addr,
            } => {
                if !self.ctx.progress.net_inserted(index) {
                    warn!(vm = %self.ctx.id, index, "unexpected netdev insertion");
                    return;
                }
                info!(vm = %self.ctx.id, %device, pci_addr, "netdev inserted");
                self.maybe_start_pod().await;
            }
            VmEvent::SerialAdded { index, port } => {
                debug!(vm = %self.ctx.id, index, %port, "serial port added");
            }
            VmEvent::DeviceFailed { cause } => {
                self.fail_run(VmError::Failed(cause.clone()));
                self.enter_cleanup(&cause);
            }
            VmEvent::Ack { op: GuestOp::StartPod, .. } => {
                info!(vm = %self.ctx.id, "pod started");
                self.state = VmState::Running;
                if let Some(reply) = self.run_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                let persist = Box::new(self.ctx.persist_info());
                let _ = self
                    .lifecycle
                    .send(VmLifecycle::Running {
                        pod_id: self.ctx.pod_id.clone(),
                        vm_id: self.ctx.id.clone(),
                        persist,
                    })
                    .await;
            }
            VmEvent::GuestError { op: GuestOp::StartPod, message } => {
                self.fail_run(VmError::Failed(message.clone()));
                self.enter_cleanup(&format!("guest rejected pod: {message}"));
            }
            VmEvent::Migrate { reply, .. } | VmEvent::Resume { reply } => {
                let _ = reply.send(Err(VmError::Busy));
            }
            other => debug!(vm = %self.ctx.id, event = other.name(), "ignored while preparing"),
        }
    }

    async fn handle_running(&mut self, event: VmEvent) {
        match event {
            VmEvent::Ack { op: GuestOp::StopPod, .. } => {
                info!(vm = %self.ctx.id, "guest acknowledged stop, quitting hypervisor");
                self.monitor.submit(quit_session()).await;
                self.state = VmState::Stopping;
            }
            VmEvent::GuestError { op: GuestOp::StopPod, message } => {
                warn!(vm = %self.ctx.id, %message, "guest failed to stop pod");
                self.enter_cleanup(&format!("stop failed: {message}"));
            }
            VmEvent::Migrate { host, port, reply } => {
                if self.migrate_reply.is_some() {
                    let _ = reply.send(Err(VmError::Busy));
                    return;
                }
                info!(vm = %self.ctx.id, %host, port, "starting memory migration");
                self.migrate_reply = Some(reply);
                self.monitor.submit(migrate_session(&host, port)).await;
                arm_timer(
                    self.hub_tx.clone(),
                    TimeoutKind::Migrate,
                    self.timeouts.migrate,
                );
            }
            VmEvent::MigrateComplete => {
                info!(vm = %self.ctx.id, "memory migration finished");
                if let Some(reply) = self.migrate_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            VmEvent::Resume { reply } => {
                if self.resume_reply.is_some() {
                    let _ = reply.send(Err(VmError::Busy));
                    return;
                }
                self.resume_reply = Some(reply);
                self.monitor.submit(cont_session()).await;
            }
            VmEvent::ResumeComplete => {
                info!(vm = %self.ctx.id, "vm resumed");
                if let Some(reply) = self.resume_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            VmEvent::DeviceFailed { cause } => {
                // A failed session while a migration is in flight means the
                // memory copy did not complete.
                if let Some(reply) = self.migrate_reply.take() {
                    warn!(vm = %self.ctx.id, %cause, "migration session failed");
                    let _ = reply.send(Err(VmError::MigrateTimeout));
                } else if let Some(reply) = self.resume_reply.take() {
                    let _ = reply.send(Err(VmError::Failed(cause)));
                } else {
                    warn!(vm = %self.ctx.id, %cause, "monitor session failed while running");
                }
            }
            VmEvent::RunPod { reply, .. } => {
                let _ = reply.send(Err(VmError::Busy));
            }
            other => debug!(vm = %self.ctx.id, event = other.name(), "ignored while running"),
        }
    }

    fn handle_stopping(&mut self, event: VmEvent) {
        match event {
            VmEvent::DeviceFailed { cause } => {
                // quit could not be delivered; the exit event will follow.
                debug!(vm = %self.ctx.id, %cause, "quit session failed while stopping");
            }
            other => debug!(vm = %self.ctx.id, event = other.name(), "ignored while stopping"),
        }
    }

    /// Compute the device plan and kick one preparation task per device.
    /// Each task reports back through the hub.
    fn prepare_devices(&mut self, spec: UserPod) {
        for (index, container) in spec.containers.iter().enumerate() {
            self.ctx.progress.plan_block(&container.id);
            let provisioner = self.provisioner.clone();
            let hub = self.hub_tx.clone();
            let id = container.id.clone();
            let image = container.image.clone();
            tokio::spawn(async move {
                match provisioner.image_device(&id, &image).await {
                    Ok(device) => {
                        let _ = hub
                            .send(VmEvent::ContainerCreated { index, id, device })
                            .await;
                    }
                    Err(e) => {
                        let _ = hub
                            .send(VmEvent::DeviceFailed {
                                cause: format!("container {id}: {e}"),
                            })
                            .await;
                    }
                }
            });
        }

        for volume in spec.volumes.iter().cloned() {
            self.ctx.progress.plan_block(&volume.name);
            let provisioner = self.provisioner.clone();
            let hub = self.hub_tx.clone();
            tokio::spawn(async move {
                if volume.source.is_empty() {
                    match provisioner.volume_device(&volume.name).await {
                        Ok(device) => {
                            let _ = hub
                                .send(VmEvent::VolumeReady {
                                    name: volume.name,
                                    device,
                                })
                                .await;
                        }
                        Err(e) => {
                            let _ = hub
                                .send(VmEvent::DeviceFailed {
                                    cause: format!("volume {}: {e}", volume.name),
                                })
                                .await;
                        }
                    }
                } else {
                    // A host-provided block device needs no preparation.
                    let device = crate::device::BlockDevice {
                        name: volume.name.clone(),
                        path: volume.source.clone().into(),
                        format: if volume.format.is_empty() {
                            "raw".to_string()
                        } else {
                            volume.format.clone()
                        },
                        fstype: if volume.fstype.is_empty() {
                            "ext4".to_string()
                        } else {
                            volume.fstype.clone()
                        },
                        metadata: Default::default(),
                    };
                    let _ = hub
                        .send(VmEvent::VolumeReady {
                            name: volume.name,
                            device,
                        })
                        .await;
                }
            });
        }

        for (index, iface) in spec.interfaces.iter().enumerate() {
            self.ctx.progress.plan_net(index);
            let provisioner = self.provisioner.clone();
            let hub = self.hub_tx.clone();
            let requested: Option<Ipv4Addr> = iface.ip.parse().ok();
            tokio::spawn(async move {
                match provisioner.allocate_tap(requested).await {
                    Ok(tap) => {
                        let _ = hub.send(VmEvent::InterfaceCreated { index, tap }).await;
                    }
                    Err(e) => {
                        let _ = hub
                            .send(VmEvent::DeviceFailed {
                                cause: format!("interface {index}: {e}"),
                            })
                            .await;
                    }
                }
            });
        }

        self.ctx.spec = Some(spec);
    }

    /// Record a prepared block device and submit its hot-plug session.
    async fn attach_blockdev(
        &mut self,
        name: String,
        source: BlockSource,
        device: crate::device::BlockDevice,
    ) {
        let scsi_id = self.ctx.next_scsi_id();
        let origin = match source {
            BlockSource::Image => self
                .ctx
                .spec
                .as_ref()
                .and_then(|s| s.containers.iter().find(|c| c.id == name))
                .map(|c| c.image.clone()),
            BlockSource::Volume => None,
        };
        self.ctx.progress.block_adding(&name);
        let session = disk_add_session(
            &name,
            source,
            &device.path.to_string_lossy(),
            &device.format,
            scsi_id,
        );
        self.ctx.blockdevs.insert(
            name.clone(),
            BlockDev {
                name,
                source,
                path: device.path,
                format: device.format,
                fstype: device.fstype,
                scsi_id,
                guest_device: monitor::scsi_device_name(scsi_id),
                metadata: device.metadata,
                origin,
            },
        );
        self.monitor.submit(session).await;
    }

    /// Send START_POD exactly once, after every planned device is present
    /// and the guest has said READY.
    async fn maybe_start_pod(&mut self) {
        if self.start_pod_sent || !self.init_ready || !self.ctx.device_ready() {
            return;
        }
        let descriptor = self.ctx.render_descriptor();
        let payload = match serde_json::to_vec(&descriptor) {
            Ok(payload) => payload,
            Err(e) => {
                self.fail_run(VmError::Failed(e.to_string()));
                self.enter_cleanup(&format!("descriptor render: {e}"));
                return;
            }
        };
        // The rendered descriptor also lands in the shared dir for the guest
        // to inspect over 9p.
        let rendered = self.ctx.share_dir.join("pod.json");
        if let Err(e) = tokio::fs::write(&rendered, &payload).await {
            warn!(vm = %self.ctx.id, error = %e, "could not write descriptor to share dir");
        }
        info!(vm = %self.ctx.id, "devices ready, starting pod");
        self.channel.request(GuestOp::StartPod, payload);
        self.start_pod_sent = true;
    }

    fn fail_run(&mut self, err: VmError) {
        if let Some(reply) = self.run_reply.take() {
            let _ = reply.send(Err(err));
        }
    }

    fn enter_cleanup(&mut self, reason: &str) {
        if self.state != VmState::Cleanup {
            self.fail_reason = Some(reason.to_string());
            self.state = VmState::Cleanup;
        }
    }

    /// Terminal state: release every acquired resource, then tell the
    /// registry. Runs exactly once.
    async fn cleanup(&mut self) {
        let reason = self
            .fail_reason
            .take()
            .unwrap_or_else(|| "shutdown".to_string());
        info!(vm = %self.ctx.id, %reason, "cleaning up vm");

        // If the hypervisor never exited on its own (init timeout, forced
        // stop), take it down now; the waiter reaps it.
        if let Some(pid) = self.ctx.pid.take() {
            debug!(vm = %self.ctx.id, pid, "killing hypervisor");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }

        // Taps: drop the fd (destroys the interface) and return the address.
        let netdevs: Vec<NetDev> = std::mem::take(&mut self.ctx.netdevs)
            .into_values()
            .collect();
        for netdev in netdevs {
            debug!(vm = %self.ctx.id, tap = %netdev.tap_name, "releasing tap");
            self.provisioner.release_address(netdev.ip);
            drop(netdev.file);
        }

        // Snapshot devices; host-provided volumes are left alone.
        let blockdevs: Vec<BlockDev> = std::mem::take(&mut self.ctx.blockdevs)
            .into_values()
            .collect();
        for dev in blockdevs {
            if dev.source == BlockSource::Volume && dev.metadata.device_size == 0 {
                continue;
            }
            if let Err(e) = self.provisioner.remove_device(&dev.name).await {
                warn!(vm = %self.ctx.id, device = %dev.name, error = %e, "device removal failed");
            }
        }

        self.provisioner.teardown_share(&self.ctx.share_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(self.ctx.paths.root()).await {
            debug!(vm = %self.ctx.id, error = %e, "vm dir removal failed");
        }

        self.fail_run(VmError::Shutdown);
        if let Some(reply) = self.migrate_reply.take() {
            let _ = reply.send(Err(VmError::Shutdown));
        }
        if let Some(reply) = self.resume_reply.take() {
            let _ = reply.send(Err(VmError::Shutdown));
        }
        for reply in self.stop_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }

        let _ = self
            .lifecycle
            .send(VmLifecycle::Stopped {
                pod_id: self.ctx.pod_id.clone(),
                vm_id: self.ctx.id.clone(),
                reason,
            })
            .await;
        info!(vm = %self.ctx.id, "vm gone");
    }
}

fn arm_timer(hub: mpsc::Sender<VmEvent>, kind: TimeoutKind, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = hub.send(VmEvent::Timeout(kind)).await;
    });
}
