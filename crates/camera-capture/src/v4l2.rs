//! Kernel V4L2 capture device
//!
//! Thin `libc` bindings for the handful of ioctls the capture path needs.
//! Request codes are derived from the structure sizes so they match the
//! kernel ABI on both 32 and 64 bit targets.

use std::ffi::CString;
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::device::{BufferInfo, ControlInfo, DequeuedBuffer, VideoDevice, CAP_DEVICE_CAPS};
use crate::format::{FormatRequest, NegotiatedFormat};
use crate::pool::MappedRegion;
use crate::DeviceError;

const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const MEMORY_MMAP: u32 = 1;
const FIELD_ANY: u32 = 0;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << 30) | ((size as u32) << 16) | ((b'V' as u32) << 8) | nr) as c_ulong
}

const fn ior<T>(nr: u32) -> c_ulong {
    ioc(IOC_READ, nr, std::mem::size_of::<T>())
}

const fn iow<T>(nr: u32) -> c_ulong {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: u32) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

// Pointer aligned like the kernel union: 204 bytes total on 32 bit, 208 on 64 bit
#[repr(C)]
#[allow(dead_code)]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    raw_data: [u8; 200],
    _align: [c_ulong; 200 / std::mem::size_of::<c_ulong>()],
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2Format {
    type_: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: c_ulong,
    planes: *mut c_void,
    fd: i32,
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
#[allow(dead_code)]
struct V4l2QueryCtrl {
    id: u32,
    type_: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

const VIDIOC_QUERYCAP: c_ulong = ior::<V4l2Capability>(0);
const VIDIOC_S_FMT: c_ulong = iowr::<V4l2Format>(5);
const VIDIOC_REQBUFS: c_ulong = iowr::<V4l2RequestBuffers>(8);
const VIDIOC_QUERYBUF: c_ulong = iowr::<V4l2Buffer>(9);
const VIDIOC_QBUF: c_ulong = iowr::<V4l2Buffer>(15);
const VIDIOC_DQBUF: c_ulong = iowr::<V4l2Buffer>(17);
const VIDIOC_STREAMON: c_ulong = iow::<c_int>(18);
const VIDIOC_STREAMOFF: c_ulong = iow::<c_int>(19);
const VIDIOC_G_CTRL: c_ulong = iowr::<V4l2Control>(27);
const VIDIOC_S_CTRL: c_ulong = iowr::<V4l2Control>(28);
const VIDIOC_QUERYCTRL: c_ulong = iowr::<V4l2QueryCtrl>(36);
const VIDIOC_S_INPUT: c_ulong = iowr::<c_int>(39);

/// Issue an ioctl, retrying when a signal interrupts it
fn xioctl<T>(
    fd: RawFd,
    request: c_ulong,
    name: &'static str,
    arg: &mut T,
) -> Result<(), DeviceError> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret != -1 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(DeviceError::Ioctl { request: name, source: err });
        }
    }
}

fn zeroed<T>() -> T {
    // SAFETY: only used for the plain-old-data ioctl structures above
    unsafe { std::mem::zeroed() }
}

fn c_str_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Capture device backed by a `/dev/videoN` node
pub struct V4l2Device {
    path: String,
    fd: Option<RawFd>,
}

impl V4l2Device {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            fd: None,
        }
    }

    fn fd(&self) -> Result<RawFd, DeviceError> {
        self.fd.ok_or(DeviceError::NotOpen)
    }

    fn capture_buffer(index: u32) -> V4l2Buffer {
        let mut buffer: V4l2Buffer = zeroed();
        buffer.type_ = BUF_TYPE_VIDEO_CAPTURE;
        buffer.memory = MEMORY_MMAP;
        buffer.index = index;
        buffer
    }
}

impl VideoDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if self.fd.is_some() {
            return Ok(());
        }

        let path = CString::new(self.path.as_str()).map_err(|e| DeviceError::Open {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(DeviceError::Open {
                path: self.path.clone(),
                source: std::io::Error::last_os_error(),
            });
        }

        debug!("Opened {} (fd {})", self.path, fd);
        self.fd = Some(fd);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!("Closing {}", self.path);
            unsafe { libc::close(fd) };
        }
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.fd
    }

    fn query_capabilities(&mut self) -> Result<u32, DeviceError> {
        let fd = self.fd()?;
        let mut cap: V4l2Capability = zeroed();
        xioctl(fd, VIDIOC_QUERYCAP, "VIDIOC_QUERYCAP", &mut cap)?;

        debug!(
            "Device {}: driver={}, card={}, bus={}",
            self.path,
            c_str_lossy(&cap.driver),
            c_str_lossy(&cap.card),
            c_str_lossy(&cap.bus_info)
        );

        if cap.capabilities & CAP_DEVICE_CAPS != 0 {
            Ok(cap.device_caps)
        } else {
            Ok(cap.capabilities)
        }
    }

    fn set_input(&mut self, index: i32) -> Result<(), DeviceError> {
        let fd = self.fd()?;
        let mut index: c_int = index;
        xioctl(fd, VIDIOC_S_INPUT, "VIDIOC_S_INPUT", &mut index)
    }

    fn set_format(&mut self, request: FormatRequest) -> Result<NegotiatedFormat, DeviceError> {
        let fd = self.fd()?;
        let mut format: V4l2Format = zeroed();
        format.type_ = BUF_TYPE_VIDEO_CAPTURE;
        format.fmt.pix = V4l2PixFormat {
            width: request.width,
            height: request.height,
            pixelformat: request.fourcc,
            field: FIELD_ANY,
            ..zeroed()
        };

        xioctl(fd, VIDIOC_S_FMT, "VIDIOC_S_FMT", &mut format)?;

        // SAFETY: the driver fills the `pix` member for capture buffers
        let pix = unsafe { format.fmt.pix };
        Ok(NegotiatedFormat {
            fourcc: pix.pixelformat,
            width: pix.width,
            height: pix.height,
            bytes_per_line: pix.bytesperline,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let fd = self.fd()?;
        let mut request: V4l2RequestBuffers = zeroed();
        request.count = count;
        request.type_ = BUF_TYPE_VIDEO_CAPTURE;
        request.memory = MEMORY_MMAP;
        xioctl(fd, VIDIOC_REQBUFS, "VIDIOC_REQBUFS", &mut request)?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, DeviceError> {
        let fd = self.fd()?;
        let mut buffer = Self::capture_buffer(index);
        xioctl(fd, VIDIOC_QUERYBUF, "VIDIOC_QUERYBUF", &mut buffer)?;
        Ok(BufferInfo {
            index,
            // SAFETY: `offset` is the active member for MMAP buffers
            offset: unsafe { buffer.m.offset },
            length: buffer.length,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MappedRegion, DeviceError> {
        let fd = self.fd()?;
        MappedRegion::mmap(fd, info.offset, info.length as usize, info.index)
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        let fd = self.fd()?;
        let mut buffer = Self::capture_buffer(index);
        xioctl(fd, VIDIOC_QBUF, "VIDIOC_QBUF", &mut buffer)
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, DeviceError> {
        let fd = self.fd()?;
        let mut buffer = Self::capture_buffer(0);
        match xioctl(fd, VIDIOC_DQBUF, "VIDIOC_DQBUF", &mut buffer) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Err(DeviceError::WouldBlock),
            Err(e) => return Err(e),
        }

        let timestamp_ns = (buffer.timestamp.tv_sec as u64) * 1_000_000_000
            + (buffer.timestamp.tv_usec as u64) * 1_000;
        Ok(DequeuedBuffer {
            index: buffer.index,
            bytes_used: buffer.bytesused,
            sequence: buffer.sequence,
            timestamp_ns,
        })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        let fd = self.fd()?;
        let mut buf_type: c_int = BUF_TYPE_VIDEO_CAPTURE as c_int;
        xioctl(fd, VIDIOC_STREAMON, "VIDIOC_STREAMON", &mut buf_type)
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        let fd = self.fd()?;
        let mut buf_type: c_int = BUF_TYPE_VIDEO_CAPTURE as c_int;
        xioctl(fd, VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF", &mut buf_type)
    }

    fn query_control(&mut self, id: u32) -> Result<Option<ControlInfo>, DeviceError> {
        let fd = self.fd()?;
        let mut query: V4l2QueryCtrl = zeroed();
        query.id = id;
        match xioctl(fd, VIDIOC_QUERYCTRL, "VIDIOC_QUERYCTRL", &mut query) {
            Ok(()) => Ok(Some(ControlInfo {
                id: query.id,
                name: c_str_lossy(&query.name),
                minimum: query.minimum,
                maximum: query.maximum,
                step: query.step,
                default_value: query.default_value,
                flags: query.flags,
            })),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError> {
        let fd = self.fd()?;
        let mut control = V4l2Control { id, value: 0 };
        xioctl(fd, VIDIOC_G_CTRL, "VIDIOC_G_CTRL", &mut control)?;
        Ok(control.value)
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        let fd = self.fd()?;
        let mut control = V4l2Control { id, value };
        match xioctl(fd, VIDIOC_S_CTRL, "VIDIOC_S_CTRL", &mut control) {
            Err(e) if e.raw_os_error() == Some(libc::ERANGE) => {
                warn!("Control {:#x} rejected value {} as out of range", id, value);
                Err(DeviceError::OutOfRange(id))
            }
            other => other,
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_sizes_match_abi() {
        assert_eq!(std::mem::size_of::<V4l2Capability>(), 104);
        assert_eq!(std::mem::size_of::<V4l2RequestBuffers>(), 20);
        assert_eq!(std::mem::size_of::<V4l2Control>(), 8);
        assert_eq!(std::mem::size_of::<V4l2QueryCtrl>(), 68);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(std::mem::size_of::<V4l2Format>(), 208);
            assert_eq!(std::mem::size_of::<V4l2Buffer>(), 88);
        }
        #[cfg(target_pointer_width = "32")]
        {
            assert_eq!(std::mem::size_of::<V4l2Format>(), 204);
            assert_eq!(std::mem::align_of::<V4l2Format>(), 4);
        }
    }

    #[test]
    fn test_request_codes() {
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_REQBUFS, 0xc014_5608);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_G_CTRL, 0xc008_561b);
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(VIDIOC_S_FMT, 0xc0d0_5605);
            assert_eq!(VIDIOC_QUERYBUF, 0xc058_5609);
        }
        #[cfg(target_pointer_width = "32")]
        assert_eq!(VIDIOC_S_FMT, 0xc0cc_5605);
    }

    #[test]
    fn test_open_missing_node_fails() {
        let mut device = V4l2Device::new("/dev/this-node-does-not-exist");
        assert!(matches!(device.open(), Err(DeviceError::Open { .. })));
        assert!(!device.is_open());
        assert!(matches!(device.query_capabilities(), Err(DeviceError::NotOpen)));
    }
}
