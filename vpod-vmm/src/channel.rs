//! Guest init channel.
//!
//! Typed request/response frames exchanged with the guest init over the
//! hyper virtio-serial socket. Frames are an 8-byte header (big-endian u32
//! opcode, big-endian u32 payload length) followed by the payload, usually
//! JSON. The guest promises an ACK or ERROR for each request before the next
//! request is sent, so requests are correlated to replies by order and the
//! sender keeps exactly one request outstanding.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::vm::events::VmEvent;

/// Upper bound on a single frame payload; anything larger is a framing error.
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Opcodes spoken on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GuestOp {
    StartPod = 1,
    StopPod = 2,
    NewContainer = 3,
    WindowSize = 4,
    Ready = 5,
    Ack = 6,
    Error = 7,
    Ping = 8,
}

impl GuestOp {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(GuestOp::StartPod),
            2 => Some(GuestOp::StopPod),
            3 => Some(GuestOp::NewContainer),
            4 => Some(GuestOp::WindowSize),
            5 => Some(GuestOp::Ready),
            6 => Some(GuestOp::Ack),
            7 => Some(GuestOp::Error),
            8 => Some(GuestOp::Ping),
            _ => None,
        }
    }
}

pub struct GuestRequest {
    pub op: GuestOp,
    pub payload: Vec<u8>,
}

/// Handle for queueing requests to the guest. Queueing never blocks; the
/// sender task drains the queue one acknowledged request at a time.
#[derive(Clone)]
pub struct GuestChannel {
    tx: mpsc::UnboundedSender<GuestRequest>,
}

impl GuestChannel {
    /// Start the channel on a listener the hypervisor's serial chardev will
    /// connect to. The channel counts as live only once the guest's READY
    /// frame arrives, surfaced on the hub as InitConnected.
    pub fn start(listener: UnixListener, hub: mpsc::Sender<VmEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(listener, rx, hub));
        Self { tx }
    }

    pub fn request(&self, op: GuestOp, payload: Vec<u8>) {
        if self.tx.send(GuestRequest { op, payload }).is_err() {
            warn!("guest channel task is gone, request dropped");
        }
    }
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 8];
    r.read_exact(&mut header).await?;
    let code = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((code, payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    op: GuestOp,
    payload: &[u8],
) -> io::Result<()> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&op.code().to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await
}

async fn run(
    listener: UnixListener,
    mut out_rx: mpsc::UnboundedReceiver<GuestRequest>,
    hub: mpsc::Sender<VmEvent>,
) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!(error = %e, "guest channel accept failed");
            let _ = hub
                .send(VmEvent::ChannelError {
                    cause: e.to_string(),
                })
                .await;
            return;
        }
    };
    debug!("guest serial connected");

    let (rd, mut wr) = stream.into_split();
    // Requests sent but not yet acked, in order. The receiver pops the front
    // on each ACK/ERROR to recover which request the reply belongs to.
    let pending = Arc::new(Mutex::new(VecDeque::<GuestOp>::new()));
    let (gate_tx, mut gate_rx) = mpsc::channel::<()>(8);
    tokio::spawn(receive(rd, hub.clone(), pending.clone(), gate_tx));

    while let Some(req) = out_rx.recv().await {
        pending.lock().unwrap().push_back(req.op);
        debug!(op = ?req.op, len = req.payload.len(), "sending guest request");
        if let Err(e) = write_frame(&mut wr, req.op, &req.payload).await {
            warn!(error = %e, "guest channel write failed");
            let _ = hub
                .send(VmEvent::ChannelError {
                    cause: e.to_string(),
                })
                .await;
            return;
        }
        // One request in flight at a time.
        if gate_rx.recv().await.is_none() {
            return;
        }
    }
}

async fn receive(
    mut rd: OwnedReadHalf,
    hub: mpsc::Sender<VmEvent>,
    pending: Arc<Mutex<VecDeque<GuestOp>>>,
    gate_tx: mpsc::Sender<()>,
) {
    let mut ready_seen = false;
    loop {
        let (code, payload) = match read_frame(&mut rd).await {
            Ok(frame) => frame,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("guest channel eof");
                return;
            }
            Err(e) => {
                let _ = hub
                    .send(VmEvent::ChannelError {
                        cause: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let Some(op) = GuestOp::from_code(code) else {
            let _ = hub
                .send(VmEvent::ChannelError {
                    cause: format!("unknown opcode {code} from guest"),
                })
                .await;
            return;
        };
        match op {
            GuestOp::Ready => {
                if !ready_seen {
                    ready_seen = true;
                    info!("guest init ready");
                    let _ = hub.send(VmEvent::InitConnected).await;
                }
            }
            GuestOp::Ack => {
                let acked = pending.lock().unwrap().pop_front();
                match acked {
                    Some(op) => {
                        let _ = hub.send(VmEvent::Ack { op, msg: payload }).await;
                        let _ = gate_tx.send(()).await;
                    }
                    None => debug!("ack with no request outstanding"),
                }
            }
            GuestOp::Error => {
                let failed = pending.lock().unwrap().pop_front();
                match failed {
                    Some(op) => {
                        let message = String::from_utf8_lossy(&payload).into_owned();
                        let _ = hub.send(VmEvent::GuestError { op, message }).await;
                        let _ = gate_tx.send(()).await;
                    }
                    None => debug!("error frame with no request outstanding"),
                }
            }
            GuestOp::Ping => {}
            other => {
                let _ = hub
                    .send(VmEvent::ChannelError {
                        cause: format!("unexpected {other:?} frame from guest"),
                    })
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, GuestOp::StartPod, br#"{"hostname":"h"}"#)
            .await
            .unwrap();
        let (code, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(GuestOp::from_code(code), Some(GuestOp::StartPod));
        assert_eq!(payload, br#"{"hostname":"h"}"#);
    }

    #[tokio::test]
    async fn empty_payload_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, GuestOp::Ping, &[]).await.unwrap();
        let (code, payload) = read_frame(&mut b).await.unwrap();
        assert_eq!(code, GuestOp::Ping.code());
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn header_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, GuestOp::StopPod, b"x").await.unwrap();
        let mut raw = [0u8; 9];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[0..4], &[0, 0, 0, 2]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 1]);
        assert_eq!(raw[8], b'x');
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = Vec::new();
        header.extend_from_slice(&GuestOp::Ack.code().to_be_bytes());
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        a.write_all(&header).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn opcode_mapping_is_total_over_known_codes() {
        for op in [
            GuestOp::StartPod,
            GuestOp::StopPod,
            GuestOp::NewContainer,
            GuestOp::WindowSize,
            GuestOp::Ready,
            GuestOp::Ack,
            GuestOp::Error,
            GuestOp::Ping,
        ] {
            assert_eq!(GuestOp::from_code(op.code()), Some(op));
        }
        assert_eq!(GuestOp::from_code(0), None);
        assert_eq!(GuestOp::from_code(99), None);
    }
}
