//! Daemon-level errors and the user-visible result codes.

use serde::Serialize;
use thiserror::Error;

use vpod_vmm::error::{DeviceError, VmError};

use crate::store::StoreError;

/// The result kinds surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultCode {
    Ok = 0,
    Failed = 1,
    VmShutdown = 2,
    NoSuchPod = 3,
    MigrateTimeout = 4,
    Busy = 5,
    Protocol = 6,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("no such pod {0}")]
    NoSuchPod(String),
    #[error("pod {0} is busy")]
    Busy(String),
    #[error("vm has shut down")]
    VmShutdown,
    #[error("migration timed out")]
    MigrateTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub fn code(&self) -> ResultCode {
        match self {
            DaemonError::NoSuchPod(_) => ResultCode::NoSuchPod,
            DaemonError::Busy(_) => ResultCode::Busy,
            DaemonError::VmShutdown => ResultCode::VmShutdown,
            DaemonError::MigrateTimeout => ResultCode::MigrateTimeout,
            DaemonError::Protocol(_) => ResultCode::Protocol,
            _ => ResultCode::Failed,
        }
    }
}

impl From<VmError> for DaemonError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Busy => DaemonError::Busy("vm".to_string()),
            VmError::Shutdown => DaemonError::VmShutdown,
            VmError::MigrateTimeout => DaemonError::MigrateTimeout,
            other => DaemonError::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ResultCode::Ok.as_i32(), 0);
        assert_eq!(ResultCode::Failed.as_i32(), 1);
        assert_eq!(ResultCode::VmShutdown.as_i32(), 2);
        assert_eq!(ResultCode::NoSuchPod.as_i32(), 3);
        assert_eq!(ResultCode::MigrateTimeout.as_i32(), 4);
        assert_eq!(ResultCode::Busy.as_i32(), 5);
        assert_eq!(ResultCode::Protocol.as_i32(), 6);
    }

    #[test]
    fn vm_errors_map_to_codes() {
        assert_eq!(
            DaemonError::from(VmError::MigrateTimeout).code(),
            ResultCode::MigrateTimeout
        );
        assert_eq!(
            DaemonError::from(VmError::Shutdown).code(),
            ResultCode::VmShutdown
        );
        assert_eq!(
            DaemonError::from(VmError::InitTimeout).code(),
            ResultCode::Failed
        );
    }
}
