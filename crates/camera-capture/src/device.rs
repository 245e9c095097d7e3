//! Capture device ioctl surface

use std::os::unix::io::RawFd;

use crate::format::{FormatRequest, NegotiatedFormat};
use crate::pool::MappedRegion;
use crate::DeviceError;

/// Device supports single-planar video capture
pub const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
/// Device supports streaming I/O
pub const CAP_STREAMING: u32 = 0x0400_0000;
/// `device_caps` is filled in and describes the opened node
pub const CAP_DEVICE_CAPS: u32 = 0x8000_0000;

/// User-class control ids
pub mod cid {
    pub const BASE: u32 = 0x0098_0900;
    pub const BRIGHTNESS: u32 = BASE;
    pub const CONTRAST: u32 = BASE + 1;
    pub const SATURATION: u32 = BASE + 2;
    pub const HFLIP: u32 = BASE + 20;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = BASE + 26;
    pub const SHARPNESS: u32 = BASE + 27;
    /// Video-detect signal exposed by analog capture front-ends
    pub const VIDEO_DETECT: u32 = BASE + 39;
    pub const LASTP1: u32 = BASE + 44;
}

/// Control is present but not usable
pub const CTRL_FLAG_DISABLED: u32 = 0x0001;

/// Location of one driver buffer inside the device's mmap space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A buffer the driver handed back after filling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp_ns: u64,
}

/// Driver description of one control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

impl ControlInfo {
    pub fn is_disabled(&self) -> bool {
        self.flags & CTRL_FLAG_DISABLED != 0
    }
}

/// The driver operations the capture state machine is built on.
///
/// `V4l2Device` issues these against a kernel node; `MockDevice` models them
/// in memory for tests and hardware-less runs.
pub trait VideoDevice: Send {
    /// Path or name used in log lines
    fn name(&self) -> &str;

    /// Open the node; a no-op when already open
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Close the node; a no-op when already closed
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Descriptor to wait on for readability, if the backend has one
    fn raw_fd(&self) -> Option<RawFd>;

    /// Capability bits describing the opened node
    fn query_capabilities(&mut self) -> Result<u32, DeviceError>;

    fn set_input(&mut self, index: i32) -> Result<(), DeviceError>;

    /// Ask for a format; returns whatever the driver settled on
    fn set_format(&mut self, request: FormatRequest) -> Result<NegotiatedFormat, DeviceError>;

    /// Request `count` mmap buffers; returns the number granted
    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError>;

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, DeviceError>;

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MappedRegion, DeviceError>;

    /// Hand a buffer to the driver for filling
    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError>;

    /// Take the next filled buffer; `WouldBlock` when none is ready
    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, DeviceError>;

    fn stream_on(&mut self) -> Result<(), DeviceError>;

    /// Stop streaming; the driver forgets every queued buffer
    fn stream_off(&mut self) -> Result<(), DeviceError>;

    /// Describe a control; `Ok(None)` when the driver does not know the id
    fn query_control(&mut self, id: u32) -> Result<Option<ControlInfo>, DeviceError>;

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError>;

    /// Write a control; ERANGE is reported as `DeviceError::OutOfRange`
    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError>;
}

impl<D: VideoDevice + ?Sized> VideoDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        (**self).raw_fd()
    }

    fn query_capabilities(&mut self) -> Result<u32, DeviceError> {
        (**self).query_capabilities()
    }

    fn set_input(&mut self, index: i32) -> Result<(), DeviceError> {
        (**self).set_input(index)
    }

    fn set_format(&mut self, request: FormatRequest) -> Result<NegotiatedFormat, DeviceError> {
        (**self).set_format(request)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        (**self).request_buffers(count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, DeviceError> {
        (**self).query_buffer(index)
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MappedRegion, DeviceError> {
        (**self).map_buffer(info)
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        (**self).queue_buffer(index)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, DeviceError> {
        (**self).dequeue_buffer()
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        (**self).stream_on()
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        (**self).stream_off()
    }

    fn query_control(&mut self, id: u32) -> Result<Option<ControlInfo>, DeviceError> {
        (**self).query_control(id)
    }

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError> {
        (**self).get_control(id)
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        (**self).set_control(id, value)
    }
}
