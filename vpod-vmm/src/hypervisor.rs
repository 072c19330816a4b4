//! Hypervisor process management: per-VM paths, command-line construction,
//! spawn and exit watching.
//!
//! The hypervisor is an opaque child process. It connects back to the
//! sockets the daemon listens on: the monitor socket for control, the hyper
//! socket for the guest init channel, and the tty socket for container
//! terminals.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::vm::events::VmEvent;

/// PCI slot where hot-plugged NICs start; below it sit the fixed devices
/// (serial controller, SCSI controller, 9p).
pub const PCI_ADDR_BASE: u32 = 0x05;

#[derive(Debug, Clone)]
pub struct VmBootConfig {
    pub hypervisor: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub cpu: u32,
    pub memory_mb: u64,
}

/// Layout of a VM's working directory.
#[derive(Debug, Clone)]
pub struct VmPaths {
    root: PathBuf,
}

impl VmPaths {
    pub fn new(base_dir: &Path, vm_id: &str) -> Self {
        Self {
            root: base_dir.join("vm").join(vm_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn monitor_socket(&self) -> PathBuf {
        self.root.join("monitor.sock")
    }

    /// Guest init channel (virtio-serial port 1).
    pub fn hyper_socket(&self) -> PathBuf {
        self.root.join("hyper.sock")
    }

    /// Container tty streams (virtio-serial port 2).
    pub fn tty_socket(&self) -> PathBuf {
        self.root.join("tty.sock")
    }

    /// Guest kernel console log.
    pub fn console_log(&self) -> PathBuf {
        self.root.join("console.log")
    }
}

/// Assemble the hypervisor invocation. `extra_args` carries pre-built device
/// arguments when restoring a migrated VM; `incoming_port` switches the VM
/// into incoming-migration mode.
pub fn build_command(
    boot: &VmBootConfig,
    paths: &VmPaths,
    share_dir: &Path,
    incoming_port: Option<u16>,
    extra_args: &[String],
) -> Command {
    let mut cmd = Command::new(&boot.hypervisor);
    cmd.arg("-machine")
        .arg("pc,accel=kvm,usb=off")
        .arg("-cpu")
        .arg("host")
        .arg("-nographic")
        .arg("-no-user-config")
        .arg("-nodefaults")
        .arg("-kernel")
        .arg(&boot.kernel)
        .arg("-initrd")
        .arg(&boot.initrd)
        .arg("-append")
        .arg("console=ttyS0 panic=1 no_timer_check")
        .arg("-smp")
        .arg(boot.cpu.to_string())
        .arg("-m")
        .arg(boot.memory_mb.to_string());

    cmd.arg("-qmp")
        .arg(format!("unix:{}", paths.monitor_socket().display()))
        .arg("-serial")
        .arg(format!("file:{}", paths.console_log().display()));

    // Guest init channel on port 1, container ttys on port 2.
    cmd.arg("-device")
        .arg("virtio-serial-pci,id=virtio-serial0,bus=pci.0,addr=0x2")
        .arg("-chardev")
        .arg(format!(
            "socket,id=charch0,path={}",
            paths.hyper_socket().display()
        ))
        .arg("-device")
        .arg("virtserialport,bus=virtio-serial0.0,nr=1,chardev=charch0,id=channel0,name=io.vpod.channel.0")
        .arg("-chardev")
        .arg(format!(
            "socket,id=charch1,path={}",
            paths.tty_socket().display()
        ))
        .arg("-device")
        .arg("virtserialport,bus=virtio-serial0.0,nr=2,chardev=charch1,id=channel1,name=io.vpod.channel.1");

    cmd.arg("-device")
        .arg("virtio-scsi-pci,id=scsi0,bus=pci.0,addr=0x3");

    cmd.arg("-fsdev")
        .arg(format!(
            "local,id=virtio9p,path={},security_model=none",
            share_dir.display()
        ))
        .arg("-device")
        .arg("virtio-9p-pci,fsdev=virtio9p,mount_tag=share_dir,bus=pci.0,addr=0x4");

    for arg in extra_args {
        cmd.arg(arg);
    }

    if let Some(port) = incoming_port {
        cmd.arg("-incoming").arg(format!("tcp:0.0.0.0:{port}"));
    }

    cmd
}

/// Spawn the hypervisor with stdout/stderr redirected into the VM dir, and
/// start the waiter that reports the exit on the hub.
pub fn launch(
    mut cmd: Command,
    vm_dir: &Path,
    hub: mpsc::Sender<VmEvent>,
) -> std::io::Result<u32> {
    let stdout = std::fs::File::create(vm_dir.join("hypervisor.stdout"))?;
    let stderr = std::fs::File::create(vm_dir.join("hypervisor.stderr"))?;
    cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

    info!(cmd = ?cmd.as_std(), "spawning hypervisor");
    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("hypervisor exited before pid was known"))?;
    info!(pid, "hypervisor started");

    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                error!(error = %e, "waiting for hypervisor failed");
                -1
            }
        };
        info!(pid, status, "hypervisor exited");
        let _ = hub.send(VmEvent::HypervisorExit { status }).await;
    });

    Ok(pid)
}

/// Accept and discard tty-channel connections so the guest's writes never
/// block. Terminal attach rides this socket when a client asks for it.
pub fn drain_listener(listener: UnixListener) {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut sink = [0u8; 4096];
                loop {
                    match stream.read(&mut sink).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => debug!(bytes = n, "tty data discarded"),
                    }
                }
            });
        }
    });
}
