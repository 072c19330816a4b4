//! VM lifecycle: spawn the hypervisor, wire up the monitor, guest channel
//! and device provisioner, and hand back a handle to the coordinator.

pub mod context;
mod coordinator;
pub mod events;
pub mod persist;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::channel::GuestChannel;
use crate::device::{Provisioner, TapDevice};
use crate::error::VmError;
use crate::hypervisor::{self, VmBootConfig, VmPaths};
use crate::monitor::Monitor;
use crate::pod::UserPod;

pub use context::VmContext;
pub use coordinator::VmTimeouts;
pub use events::{VmEvent, VmReply};
pub use persist::VmPersistInfo;

use coordinator::Coordinator;
use events::TimeoutKind;

/// Notifications from a coordinator to the pod registry. Delivered on a
/// daemon-owned channel so nothing here runs under the registry lock.
pub enum VmLifecycle {
    /// The pod reached RUNNING; `persist` is the durable VM record.
    Running {
        pod_id: String,
        vm_id: String,
        persist: Box<VmPersistInfo>,
    },
    /// The VM is gone and all its resources are released.
    Stopped {
        pod_id: String,
        vm_id: String,
        reason: String,
    },
}

/// The request channel to one VM's coordinator.
#[derive(Clone)]
pub struct VmHandle {
    pub id: String,
    tx: mpsc::Sender<VmEvent>,
}

impl VmHandle {
    async fn request(
        &self,
        build: impl FnOnce(VmReply) -> VmEvent,
    ) -> Result<(), VmError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| VmError::Shutdown)?;
        reply_rx.await.map_err(|_| VmError::Shutdown)?
    }

    /// Run a pod in this VM. Resolves once the guest acknowledges START_POD
    /// or the VM fails.
    pub async fn run_pod(&self, spec: UserPod) -> Result<(), VmError> {
        self.request(|reply| VmEvent::RunPod {
            spec: Box::new(spec),
            reply,
        })
        .await
    }

    /// Stop the pod and shut the VM down. Resolves after cleanup.
    pub async fn stop(&self) -> Result<(), VmError> {
        self.request(|reply| VmEvent::StopPod { reply }).await
    }

    /// Copy VM memory to a peer daemon listening on `host:port`.
    pub async fn migrate(&self, host: &str, port: u16) -> Result<(), VmError> {
        let host = host.to_string();
        self.request(move |reply| VmEvent::Migrate { host, port, reply })
            .await
    }

    /// Resume a VM that stayed paused after a failed migration.
    pub async fn resume(&self) -> Result<(), VmError> {
        self.request(|reply| VmEvent::Resume { reply }).await
    }

    /// Tear the VM down without the graceful guest dialog. Cleanup still
    /// releases every resource; there is no reply.
    pub async fn terminate(&self) {
        let _ = self.tx.send(VmEvent::Quit).await;
    }

    /// Post a raw timeout, for driving the coordinator from timers.
    pub async fn post_timeout_migrate(&self) {
        let _ = self.tx.send(VmEvent::Timeout(TimeoutKind::Migrate)).await;
    }
}

/// How to bring the VM up.
pub struct VmOptions {
    pub vm_id: String,
    pub pod_id: String,
    pub base_dir: PathBuf,
    pub boot: VmBootConfig,
    pub timeouts: VmTimeouts,
    /// Listen for an incoming memory migration on this port.
    pub incoming_port: Option<u16>,
    /// Pre-built device arguments for a restored VM.
    pub extra_args: Vec<String>,
    /// Restored VM record plus the re-allocated taps, by interface index.
    pub restore: Option<(Box<VmPersistInfo>, Vec<(usize, TapDevice)>)>,
}

/// Spawn the hypervisor and every per-VM task, returning the coordinator
/// handle. On error nothing is left behind.
pub async fn start_vm(
    opts: VmOptions,
    provisioner: Arc<dyn Provisioner>,
    lifecycle: mpsc::Sender<VmLifecycle>,
) -> Result<VmHandle, VmError> {
    let VmOptions {
        vm_id,
        pod_id,
        base_dir,
        boot,
        timeouts,
        incoming_port,
        extra_args,
        restore,
    } = opts;

    let paths = VmPaths::new(&base_dir, &vm_id);
    tokio::fs::create_dir_all(paths.root()).await?;
    for sock in [
        paths.monitor_socket(),
        paths.hyper_socket(),
        paths.tty_socket(),
    ] {
        let _ = tokio::fs::remove_file(sock).await;
    }

    let share_dir = provisioner.setup_share(paths.root()).await?;

    let bring_up = async {
        let monitor_listener = UnixListener::bind(paths.monitor_socket())?;
        let hyper_listener = UnixListener::bind(paths.hyper_socket())?;
        let tty_listener = UnixListener::bind(paths.tty_socket())?;
        hypervisor::drain_listener(tty_listener);

        let (hub_tx, hub_rx) = mpsc::channel::<VmEvent>(128);
        let cmd = hypervisor::build_command(&boot, &paths, &share_dir, incoming_port, &extra_args);
        let pid = hypervisor::launch(cmd, paths.root(), hub_tx.clone())?;

        let monitor = Monitor::start(monitor_listener, hub_tx.clone());
        let channel = GuestChannel::start(hyper_listener, hub_tx.clone());

        let restored = restore.is_some();
        let mut ctx = match restore {
            Some((info, taps)) => VmContext::restore(&info, paths.clone(), boot.clone(), taps),
            None => VmContext::new(&vm_id, &pod_id, paths.clone(), boot.clone()),
        };
        ctx.pid = Some(pid);
        ctx.share_dir = share_dir.clone();

        let coordinator = Coordinator::new(
            ctx,
            restored,
            hub_rx,
            hub_tx.clone(),
            monitor,
            channel,
            provisioner.clone(),
            lifecycle.clone(),
            timeouts,
        );
        tokio::spawn(coordinator.run());

        info!(vm = %vm_id, pod = %pod_id, pid, "vm started");
        Ok::<_, VmError>(VmHandle {
            id: vm_id.clone(),
            tx: hub_tx,
        })
    };

    match bring_up.await {
        Ok(handle) => Ok(handle),
        Err(e) => {
            warn!(vm = %vm_id, error = %e, "vm bring-up failed, unwinding");
            provisioner.teardown_share(&share_dir).await;
            let _ = tokio::fs::remove_dir_all(paths.root()).await;
            Err(e)
        }
    }
}
