//! Camera Capture Device Layer
//!
//! Provides the capture-device side of the camera pipeline:
//! - `VideoDevice`: the ioctl surface the capture state machine drives
//! - `V4l2Device`: kernel video-capture node over raw ioctls
//! - `MockDevice`: in-memory driver for tests and hardware-less runs
//! - `BufferPool`: fixed set of memory-mapped driver buffers

pub mod device;
pub mod format;
pub mod mock;
pub mod pool;
pub mod v4l2;

mod error;

pub use device::{BufferInfo, ControlInfo, DequeuedBuffer, VideoDevice};
pub use error::DeviceError;
pub use format::{FormatRequest, NegotiatedFormat, PixelFormat};
pub use mock::{MockDevice, MockFault};
pub use pool::{BufferPool, BufferSlot, MappedRegion};
pub use v4l2::V4l2Device;

/// Default capture node
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Number of driver buffers kept in the pool
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
