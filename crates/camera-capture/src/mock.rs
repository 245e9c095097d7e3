//! In-memory capture driver
//!
//! Behaves like a small V4L2 capture driver: it grants buffers, keeps a
//! driver queue, hands buffers back in order once streaming, and answers
//! control queries from a table. Tests keep a clone to flip the presence
//! signal, inject faults and inspect the queue.

use std::collections::{BTreeMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{
    cid, BufferInfo, ControlInfo, DequeuedBuffer, VideoDevice, CAP_STREAMING, CAP_VIDEO_CAPTURE,
    CTRL_FLAG_DISABLED,
};
use crate::format::{FormatRequest, NegotiatedFormat, PixelFormat, FOURCC_UYVY};
use crate::pool::MappedRegion;
use crate::DeviceError;

const PAGE_SIZE: u32 = 4096;

/// One-shot failure injected into the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Open,
    QueryCapabilities,
    SetInput,
    SetFormat,
    RequestBuffers,
    QueryBuffer(u32),
    MapBuffer(u32),
    QueueBuffer(u32),
    StreamOn,
    StreamOff,
    Dequeue,
}

#[derive(Debug, Clone)]
struct MockControl {
    name: &'static str,
    minimum: i32,
    maximum: i32,
    value: i32,
    flags: u32,
}

#[derive(Debug)]
struct MockState {
    present: bool,
    connected: bool,
    signal_control: bool,
    open: bool,
    open_count: u32,
    capabilities: u32,
    input: Option<i32>,
    driver_fourcc: Option<u32>,
    width: u32,
    height: u32,
    buffer_length: Option<usize>,
    granted: u32,
    extra_buffers: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    double_enqueues: u32,
    controls: BTreeMap<u32, MockControl>,
    faults: Vec<MockFault>,
}

impl MockState {
    fn take_fault(&mut self, fault: MockFault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                self.faults.remove(pos);
                true
            }
            None => false,
        }
    }

    fn require_open(&self) -> Result<(), DeviceError> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    fn bytes_per_line(&self, fourcc: u32) -> u32 {
        if PixelFormat::from_fourcc(fourcc).is_planar_420() {
            self.width
        } else {
            self.width * 2
        }
    }
}

fn errno(request: &'static str, code: i32) -> DeviceError {
    DeviceError::Ioctl {
        request,
        source: std::io::Error::from_raw_os_error(code),
    }
}

/// Mock capture device; clones share the same driver state
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A connected 720x480 device with brightness, contrast, saturation,
    /// horizontal flip and a disabled sharpness control
    pub fn new() -> Self {
        let mut controls = BTreeMap::new();
        controls.insert(
            cid::BRIGHTNESS,
            MockControl { name: "Brightness", minimum: -128, maximum: 127, value: 0, flags: 0 },
        );
        controls.insert(
            cid::CONTRAST,
            MockControl { name: "Contrast", minimum: 0, maximum: 255, value: 128, flags: 0 },
        );
        controls.insert(
            cid::SATURATION,
            MockControl { name: "Saturation", minimum: 0, maximum: 200, value: 100, flags: 0 },
        );
        controls.insert(
            cid::HFLIP,
            MockControl { name: "Horizontal Flip", minimum: 0, maximum: 1, value: 0, flags: 0 },
        );
        controls.insert(
            cid::SHARPNESS,
            MockControl {
                name: "Sharpness",
                minimum: 0,
                maximum: 15,
                value: 7,
                flags: CTRL_FLAG_DISABLED,
            },
        );

        Self {
            state: Arc::new(Mutex::new(MockState {
                present: true,
                connected: true,
                signal_control: true,
                open: false,
                open_count: 0,
                capabilities: CAP_VIDEO_CAPTURE | CAP_STREAMING,
                input: None,
                driver_fourcc: None,
                width: 720,
                height: 480,
                buffer_length: None,
                granted: 0,
                extra_buffers: 0,
                queued: VecDeque::new(),
                streaming: false,
                sequence: 0,
                double_enqueues: 0,
                controls,
                faults: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Video-detect signal value
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Whether the node can be opened at all
    pub fn set_present(&self, present: bool) {
        let mut state = self.lock();
        state.present = present;
        if !present {
            state.open = false;
            state.streaming = false;
            state.queued.clear();
            state.granted = 0;
        }
    }

    /// Drop the video-detect control from the driver
    pub fn set_signal_control(&self, available: bool) {
        self.lock().signal_control = available;
    }

    pub fn set_capabilities(&self, capabilities: u32) {
        self.lock().capabilities = capabilities;
    }

    /// Fourcc the driver answers with regardless of the request
    pub fn set_driver_format(&self, fourcc: u32) {
        self.lock().driver_fourcc = Some(fourcc);
    }

    pub fn set_resolution(&self, width: u32, height: u32) {
        let mut state = self.lock();
        state.width = width;
        state.height = height;
    }

    /// Length the driver reports for each buffer
    pub fn set_buffer_length(&self, length: usize) {
        self.lock().buffer_length = Some(length);
    }

    /// Grant `extra` buffers beyond every request
    pub fn set_extra_buffers(&self, extra: u32) {
        self.lock().extra_buffers = extra;
    }

    pub fn inject_fault(&self, fault: MockFault) {
        self.lock().faults.push(fault);
    }

    /// Add or replace a control
    pub fn add_control(&self, id: u32, minimum: i32, maximum: i32, value: i32, disabled: bool) {
        let flags = if disabled { CTRL_FLAG_DISABLED } else { 0 };
        self.lock().controls.insert(
            id,
            MockControl { name: "Custom", minimum, maximum, value, flags },
        );
    }

    /// Current raw value of a control
    pub fn control_value(&self, id: u32) -> Option<i32> {
        self.lock().controls.get(&id).map(|c| c.value)
    }

    /// Overwrite a control value behind the driver's back
    pub fn force_control_value(&self, id: u32, value: i32) {
        if let Some(control) = self.lock().controls.get_mut(&id) {
            control.value = value;
        }
    }

    /// Buffers currently owned by the driver, in queue order
    pub fn queued_indexes(&self) -> Vec<u32> {
        self.lock().queued.iter().copied().collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    /// Attempts to queue a buffer the driver already owned
    pub fn double_enqueue_count(&self) -> u32 {
        self.lock().double_enqueues
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    pub fn input(&self) -> Option<i32> {
        self.lock().input
    }
}

impl VideoDevice for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.open {
            return Ok(());
        }
        if !state.present || state.take_fault(MockFault::Open) {
            return Err(DeviceError::Open {
                path: "mock".to_string(),
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.open = false;
        state.streaming = false;
        state.queued.clear();
        state.granted = 0;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn query_capabilities(&mut self) -> Result<u32, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if !state.present {
            return Err(errno("VIDIOC_QUERYCAP", libc::ENODEV));
        }
        if state.take_fault(MockFault::QueryCapabilities) {
            return Err(errno("VIDIOC_QUERYCAP", libc::EIO));
        }
        Ok(state.capabilities)
    }

    fn set_input(&mut self, index: i32) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.take_fault(MockFault::SetInput) {
            return Err(errno("VIDIOC_S_INPUT", libc::EINVAL));
        }
        state.input = Some(index);
        Ok(())
    }

    fn set_format(&mut self, request: FormatRequest) -> Result<NegotiatedFormat, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.take_fault(MockFault::SetFormat) {
            return Err(errno("VIDIOC_S_FMT", libc::EINVAL));
        }
        if request.width != 0 && request.height != 0 {
            state.width = request.width;
            state.height = request.height;
        }

        let fourcc = state.driver_fourcc.unwrap_or(request.fourcc);
        let fourcc = if fourcc == 0 { FOURCC_UYVY } else { fourcc };
        let bytes_per_line = state.bytes_per_line(fourcc);
        Ok(NegotiatedFormat {
            fourcc,
            width: state.width,
            height: state.height,
            bytes_per_line,
            size_image: bytes_per_line * state.height,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.streaming {
            return Err(errno("VIDIOC_REQBUFS", libc::EBUSY));
        }
        if state.take_fault(MockFault::RequestBuffers) {
            return Err(errno("VIDIOC_REQBUFS", libc::ENOMEM));
        }
        state.granted = count + state.extra_buffers;
        state.queued.clear();
        Ok(state.granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if index >= state.granted || state.take_fault(MockFault::QueryBuffer(index)) {
            return Err(errno("VIDIOC_QUERYBUF", libc::EINVAL));
        }
        let length = state
            .buffer_length
            .unwrap_or((state.width * state.height * 2) as usize) as u32;
        let stride = length.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        Ok(BufferInfo {
            index,
            offset: index * stride,
            length,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MappedRegion, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.take_fault(MockFault::MapBuffer(info.index)) {
            return Err(DeviceError::Map {
                index: info.index,
                source: std::io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        Ok(MappedRegion::heap(info.length as usize))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if index >= state.granted || state.take_fault(MockFault::QueueBuffer(index)) {
            return Err(errno("VIDIOC_QBUF", libc::EINVAL));
        }
        if state.queued.contains(&index) {
            state.double_enqueues += 1;
            return Err(errno("VIDIOC_QBUF", libc::EINVAL));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.take_fault(MockFault::Dequeue) {
            return Err(errno("VIDIOC_DQBUF", libc::EIO));
        }
        if !state.streaming {
            return Err(errno("VIDIOC_DQBUF", libc::EINVAL));
        }
        let index = state.queued.pop_front().ok_or(DeviceError::WouldBlock)?;
        state.sequence = state.sequence.wrapping_add(1);
        let bytes_used = state.bytes_per_line(state.driver_fourcc.unwrap_or(FOURCC_UYVY))
            * state.height;
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            sequence: state.sequence,
            timestamp_ns: u64::from(state.sequence) * 40_000_000,
        })
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.granted == 0 || state.take_fault(MockFault::StreamOn) {
            return Err(errno("VIDIOC_STREAMON", libc::EINVAL));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        if state.take_fault(MockFault::StreamOff) {
            return Err(errno("VIDIOC_STREAMOFF", libc::EIO));
        }
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn query_control(&mut self, id: u32) -> Result<Option<ControlInfo>, DeviceError> {
        let state = self.lock();
        state.require_open()?;
        if id == cid::VIDEO_DETECT && state.signal_control {
            return Ok(Some(ControlInfo {
                id,
                name: "Video Detect".to_string(),
                minimum: 0,
                maximum: 1,
                step: 1,
                default_value: 0,
                flags: 0,
            }));
        }
        Ok(state.controls.get(&id).map(|control| ControlInfo {
            id,
            name: control.name.to_string(),
            minimum: control.minimum,
            maximum: control.maximum,
            step: 1,
            default_value: control.value,
            flags: control.flags,
        }))
    }

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError> {
        let state = self.lock();
        state.require_open()?;
        if id == cid::VIDEO_DETECT {
            if !state.signal_control {
                return Err(errno("VIDIOC_G_CTRL", libc::EINVAL));
            }
            return Ok(i32::from(state.present && state.connected));
        }
        match state.controls.get(&id) {
            Some(control) if control.flags & CTRL_FLAG_DISABLED == 0 => Ok(control.value),
            _ => Err(errno("VIDIOC_G_CTRL", libc::EINVAL)),
        }
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_open()?;
        match state.controls.get_mut(&id) {
            Some(control) if control.flags & CTRL_FLAG_DISABLED == 0 => {
                if value < control.minimum || value > control.maximum {
                    return Err(DeviceError::OutOfRange(id));
                }
                control.value = value;
                Ok(())
            }
            _ => Err(errno("VIDIOC_S_CTRL", libc::EINVAL)),
        }
    }
}
