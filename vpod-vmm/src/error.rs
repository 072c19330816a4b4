//! Error types for the per-VM core.

use std::io;

use thiserror::Error;

/// Errors from the monitor protocol client.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor handshake failed: {0}")]
    Handshake(String),
    #[error("monitor closed")]
    Closed,
    #[error("monitor command {command} failed: {desc}")]
    Command { command: String, desc: String },
    #[error("monitor protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from host-side device preparation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("address pool exhausted on {0}")]
    PoolExhausted(String),
    #[error("invalid network configuration: {0}")]
    Config(String),
    #[error("device metadata for {id} is unusable: {reason}")]
    Metadata { id: String, reason: String },
    #[error("mount {target} failed: {source}")]
    Mount { target: String, source: nix::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// VM-level errors surfaced to callers of the coordinator.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm is busy")]
    Busy,
    #[error("vm has shut down")]
    Shutdown,
    #[error("init timeout")]
    InitTimeout,
    #[error("migration timed out")]
    MigrateTimeout,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
