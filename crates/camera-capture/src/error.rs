//! Device Error Types

use thiserror::Error;

/// Errors reported by a capture device backend
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device node could not be opened
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation needed an open handle
    #[error("Device is not open")]
    NotOpen,

    /// A driver request failed
    #[error("{request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Mapping a driver buffer into the process failed
    #[error("Failed to map buffer {index}: {source}")]
    Map {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    /// The driver granted fewer buffers than the pool needs
    #[error("Driver granted {granted} buffers, {requested} required")]
    BufferCount { requested: u32, granted: u32 },

    /// Control write rejected with ERANGE
    #[error("Control {0:#x} value out of range")]
    OutOfRange(u32),

    /// Non-blocking dequeue found no completed buffer
    #[error("No completed buffer available")]
    WouldBlock,
}

impl DeviceError {
    /// Raw OS error code, if the failure came from the kernel
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            DeviceError::Open { source, .. }
            | DeviceError::Ioctl { source, .. }
            | DeviceError::Map { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
