//! Monitor protocol client.
//!
//! Owns the hypervisor's control socket and multiplexes its three frame
//! streams: requests we send, their responses, and asynchronous events.
//! Callers submit sessions (ordered command groups with one callback); the
//! client guarantees sessions run FIFO without interleaving, retries
//! transient command errors, and fires each callback exactly once.

mod protocol;

use std::io::{self, IoSlice};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

pub use protocol::{
    EVENT_RESET, EVENT_RESUME, EVENT_SHUTDOWN, EVENT_STOP, MonCommand, MonEvent, MonRequest,
    MonSession, cont_session, disk_add_session, migrate_session, netdev_add_session, quit_session,
    scsi_device_id, scsi_device_name, serial_add_session,
};
use protocol::{MonMessage, decode_message};

use crate::error::MonitorError;
use crate::vm::events::VmEvent;

/// How many times a single command is attempted before its session aborts.
const COMMAND_ATTEMPTS: u32 = 3;
const COMMAND_RETRY_DELAY: Duration = Duration::from_secs(1);
const ACCEPT_DEADLINE: Duration = Duration::from_secs(5);
const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Handle for submitting sessions. The underlying task keeps running (and
/// keeps failing queued sessions once closed) until every handle is dropped.
#[derive(Clone)]
pub struct Monitor {
    tx: mpsc::Sender<MonSession>,
}

impl Monitor {
    /// Start the client on a listener the hypervisor will connect to.
    pub fn start(listener: UnixListener, hub: mpsc::Sender<VmEvent>) -> Self {
        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(run(listener, rx, hub));
        Self { tx }
    }

    /// Queue a session. The callback arrives on the hub, never here.
    pub async fn submit(&self, session: MonSession) {
        if self.tx.send(session).await.is_err() {
            error!("monitor task is gone, session dropped");
        }
    }
}

/// Response frames routed to the commander.
enum Incoming {
    Ret(serde_json::Value),
    Err { class: String, desc: String },
}

async fn run(
    listener: UnixListener,
    mut session_rx: mpsc::Receiver<MonSession>,
    hub: mpsc::Sender<VmEvent>,
) {
    let (stream, reader) = match timeout(INIT_DEADLINE, initialize(&listener)).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            error!(error = %e, "monitor init failed");
            let _ = hub
                .send(VmEvent::InitFailed {
                    reason: e.to_string(),
                })
                .await;
            fail_remaining(&mut session_rx, &hub).await;
            return;
        }
        Err(_) => {
            error!("monitor init timeout");
            let _ = hub
                .send(VmEvent::InitFailed {
                    reason: "monitor init timeout".to_string(),
                })
                .await;
            fail_remaining(&mut session_rx, &hub).await;
            return;
        }
    };

    info!("monitor initialized");

    let stream = Arc::new(stream);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Incoming>(128);
    tokio::spawn(receive(stream.clone(), reader, resp_tx, hub.clone()));

    loop {
        tokio::select! {
            next = session_rx.recv() => {
                let Some(session) = next else { return };
                let MonSession { commands, done } = session;
                match run_session(&stream, &mut resp_rx, &commands).await {
                    Ok(()) => {
                        debug!("monitor session finished");
                        if let Some(done) = done {
                            let _ = hub.send(done).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "monitor session failed");
                        let closed = matches!(e, MonitorError::Closed);
                        let _ = hub
                            .send(VmEvent::DeviceFailed { cause: e.to_string() })
                            .await;
                        if closed {
                            break;
                        }
                    }
                }
            }
            stray = resp_rx.recv() => {
                match stray {
                    // Receiver is gone: the monitor closed while idle.
                    None => break,
                    Some(_) => debug!("dropping response with no session in flight"),
                }
            }
        }
    }

    fail_remaining(&mut session_rx, &hub).await;
}

/// Accept the hypervisor's connection, read the greeting banner, negotiate
/// capabilities. Any deviation is INIT_FAILED for the coordinator.
async fn initialize(listener: &UnixListener) -> Result<(UnixStream, LineReader), MonitorError> {
    let stream = match timeout(ACCEPT_DEADLINE, listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(MonitorError::Handshake(
                "hypervisor did not connect to monitor socket".to_string(),
            ));
        }
    };

    let mut reader = LineReader::new();
    let banner = reader
        .next_line(&stream)
        .await?
        .ok_or_else(|| MonitorError::Handshake("eof before greeting".to_string()))?;
    match decode_message(&banner)? {
        MonMessage::Welcome(_) => {}
        _ => {
            return Err(MonitorError::Handshake(
                "first frame was not the greeting banner".to_string(),
            ));
        }
    }

    let capabilities = serde_json::to_vec(&MonRequest::bare("qmp_capabilities"))
        .map_err(|e| MonitorError::Protocol(e.to_string()))?;
    write_frame(&stream, &capabilities, None).await?;

    let reply = reader
        .next_line(&stream)
        .await?
        .ok_or_else(|| MonitorError::Handshake("eof during capability negotiation".to_string()))?;
    match decode_message(&reply)? {
        MonMessage::Return(_) => Ok((stream, reader)),
        MonMessage::Error { desc, .. } => Err(MonitorError::Handshake(desc)),
        _ => Err(MonitorError::Handshake(
            "unexpected reply to qmp_capabilities".to_string(),
        )),
    }
}

/// Receiver: decodes frames until EOF, a protocol error, or SHUTDOWN.
/// Responses go to the commander; events go to the coordinator out-of-band.
async fn receive(
    stream: Arc<UnixStream>,
    mut reader: LineReader,
    resp_tx: mpsc::Sender<Incoming>,
    hub: mpsc::Sender<VmEvent>,
) {
    loop {
        let line = match reader.next_line(&stream).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("monitor socket closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "monitor read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_message(&line) {
            Ok(MonMessage::Return(v)) => {
                let _ = resp_tx.send(Incoming::Ret(v)).await;
            }
            Ok(MonMessage::Error { class, desc }) => {
                let _ = resp_tx.send(Incoming::Err { class, desc }).await;
            }
            Ok(MonMessage::Event(ev)) => {
                let shutdown = ev.name == EVENT_SHUTDOWN;
                info!(event = %ev.name, "monitor event");
                let _ = hub.send(VmEvent::MonitorEvent(ev)).await;
                if shutdown {
                    break;
                }
            }
            Ok(MonMessage::Welcome(_)) => debug!("ignoring repeated greeting banner"),
            Err(e) => {
                error!(error = %e, "monitor protocol error");
                break;
            }
        }
    }
    // Dropping resp_tx tells the commander the monitor is closed.
}

/// Issue one session's commands in order. Transient errors retry up to
/// [`COMMAND_ATTEMPTS`] times with a fixed delay; the first exhausted command
/// aborts the session.
async fn run_session(
    stream: &UnixStream,
    resp_rx: &mut mpsc::Receiver<Incoming>,
    commands: &[MonCommand],
) -> Result<(), MonitorError> {
    for cmd in commands {
        let payload = serde_json::to_vec(&cmd.request)
            .map_err(|e| MonitorError::Protocol(e.to_string()))?;
        let mut last_desc = String::new();
        let mut done = false;
        for attempt in 0..COMMAND_ATTEMPTS {
            if attempt > 0 {
                sleep(COMMAND_RETRY_DELAY).await;
            }
            debug!(command = %cmd.request.execute, attempt = attempt + 1, "sending monitor command");
            write_frame(stream, &payload, cmd.fd).await?;
            match resp_rx.recv().await {
                None => return Err(MonitorError::Closed),
                Some(Incoming::Ret(_)) => {
                    done = true;
                    break;
                }
                Some(Incoming::Err { class, desc }) => {
                    warn!(command = %cmd.request.execute, %class, %desc, "monitor command error");
                    last_desc = desc;
                }
            }
        }
        if !done {
            return Err(MonitorError::Command {
                command: cmd.request.execute.clone(),
                desc: last_desc,
            });
        }
    }
    Ok(())
}

async fn fail_remaining(session_rx: &mut mpsc::Receiver<MonSession>, hub: &mpsc::Sender<VmEvent>) {
    while let Some(_session) = session_rx.recv().await {
        let _ = hub
            .send(VmEvent::DeviceFailed {
                cause: "monitor closed".to_string(),
            })
            .await;
    }
}

/// Write one frame. When a descriptor rides along it must be in the same
/// sendmsg as the payload, so the kernel delivers the SCM_RIGHTS message
/// with these bytes.
async fn write_frame(stream: &UnixStream, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let mut written = match fd {
        Some(fd) => {
            let fds = [fd];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            loop {
                stream.writable().await?;
                let res = stream.try_io(Interest::WRITABLE, || {
                    sendmsg::<UnixAddr>(
                        stream.as_raw_fd(),
                        &[IoSlice::new(payload)],
                        &cmsgs,
                        MsgFlags::empty(),
                        None,
                    )
                    .map_err(io::Error::from)
                });
                match res {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        None => 0,
    };

    while written < payload.len() {
        stream.writable().await?;
        match stream.try_write(&payload[written..]) {
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Incremental newline splitter over a shared stream. Only the receiver (and
/// the initializer before it) reads; writes happen elsewhere.
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    async fn next_line(&mut self, stream: &UnixStream) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            stream.readable().await?;
            let mut chunk = [0u8; 4096];
            match stream.try_read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
