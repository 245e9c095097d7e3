//! Capture state machine
//!
//! `CameraControl` is the single owner of the capture device. All state
//! lives behind one mutex that is held for the whole of every transition,
//! including the device calls it makes. Events produced during a transition
//! are collected and sent only after the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camera_capture::device::{cid, CAP_VIDEO_CAPTURE};
use camera_capture::{BufferPool, DeviceError, FormatRequest, PixelFormat, VideoDevice};
use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::{CameraConfig, PresenceProbe};
use crate::event::CameraEvent;
use crate::frame::{Frame, FrameHandle, FrameSize};
use crate::parameter::{CameraParameter, ControlDescriptor, MAX_PARAMETER_VALUE};
use crate::session::{SessionArbiter, SessionId};
use crate::state::{CaptureState, PendingAction};
use crate::CameraError;

/// How the event loop should wait for the next frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not streaming
    Idle,
    /// Wait for the descriptor to become readable
    Descriptor(RawFd),
    /// Streaming on a backend without a descriptor; try a dequeue on each wake-up
    Polled,
}

pub(crate) struct Inner {
    device: Box<dyn VideoDevice>,
    config: CameraConfig,
    state: CaptureState,
    action: PendingAction,
    pool: Option<BufferPool>,
    pixel_format: PixelFormat,
    source_size: FrameSize,
    controls: BTreeMap<CameraParameter, ControlDescriptor>,
    /// Slots dequeued and not yet given back by a consumer
    checked_out: BTreeSet<u32>,
    /// Advanced on every stream start, stop and unload
    epoch: u64,
    sessions: SessionArbiter,
    connected: bool,
    poll_interval: Option<Duration>,
}

pub(crate) fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn new(device: Box<dyn VideoDevice>, config: CameraConfig) -> Self {
        Self {
            device,
            config,
            state: CaptureState::Unloaded,
            action: PendingAction::Idle,
            pool: None,
            pixel_format: PixelFormat::Invalid,
            source_size: FrameSize::default(),
            controls: BTreeMap::new(),
            checked_out: BTreeSet::new(),
            epoch: 0,
            sessions: SessionArbiter::new(),
            connected: false,
            poll_interval: None,
        }
    }

    pub(crate) fn is_checked_out(&self, index: u32, epoch: u64) -> bool {
        self.state == CaptureState::Active
            && self.epoch == epoch
            && self.checked_out.contains(&index)
    }

    pub(crate) fn checked_out_data(&self, index: u32, epoch: u64) -> Option<&[u8]> {
        if !self.is_checked_out(index, epoch) {
            return None;
        }
        self.pool.as_ref()?.slot(index).map(|slot| slot.data())
    }

    /// Give a consumer's slot back to the driver
    pub(crate) fn requeue(&mut self, index: u32, epoch: u64) {
        if !self.is_checked_out(index, epoch) {
            debug!("Ignoring release of stale buffer {}", index);
            return;
        }
        self.checked_out.remove(&index);

        match self.device.queue_buffer(index) {
            Ok(()) => counter!("camera_frames_released_total").increment(1),
            Err(e) => warn!("Failed to requeue buffer {}: {}", index, e),
        }
    }

    fn load(&mut self, events: &mut Vec<CameraEvent>) -> Result<(), CameraError> {
        if self.state != CaptureState::Unloaded {
            debug!("Load requested while {:?}, nothing to do", self.state);
            return Ok(());
        }

        self.device.close();
        if let Err(e) = self.configure(events) {
            error!("Failed to load {}: {}", self.device.name(), e);
            counter!("camera_load_failures_total").increment(1);
            self.release_resources();
            return Err(e);
        }

        info!(
            "Loaded {}: {:?} {}x{}, {} buffers, {} controls",
            self.device.name(),
            self.pixel_format,
            self.source_size.width,
            self.source_size.height,
            self.pool.as_ref().map_or(0, BufferPool::len),
            self.controls.len()
        );
        Ok(())
    }

    fn configure(&mut self, events: &mut Vec<CameraEvent>) -> Result<(), CameraError> {
        self.device.open()?;

        let capabilities = self.device.query_capabilities()?;
        if capabilities & CAP_VIDEO_CAPTURE == 0 {
            return Err(CameraError::NoCaptureCapability);
        }

        self.device.set_input(self.config.input_index)?;

        let format = self.device.set_format(FormatRequest {
            fourcc: self.config.preferred_fourcc(),
            width: 0,
            height: 0,
        })?;
        self.pixel_format = format.pixel_format();
        if !self.pixel_format.is_valid() {
            warn!("Driver negotiated unrecognized format {:#010x}", format.fourcc);
        }

        let size = FrameSize {
            width: format.width,
            height: format.height,
        };
        if size != self.source_size {
            self.source_size = size;
            events.push(CameraEvent::SourceSizeChanged {
                width: size.width,
                height: size.height,
            });
        }

        let count = self.config.buffer_count;
        let granted = self.device.request_buffers(count)?;
        if granted < count {
            return Err(DeviceError::BufferCount {
                requested: count,
                granted,
            }
            .into());
        }

        self.pool = Some(BufferPool::map(self.device.as_mut(), count, &format)?);
        self.enumerate_controls();
        self.state = CaptureState::Loaded;
        Ok(())
    }

    fn enumerate_controls(&mut self) {
        self.controls.clear();

        for id in cid::BASE..cid::LASTP1 {
            match self.device.query_control(id) {
                Ok(Some(info)) if info.is_disabled() => {
                    debug!("Skipping disabled control '{}'", info.name);
                }
                Ok(Some(info)) => {
                    if let Some(descriptor) = ControlDescriptor::from_info(&info) {
                        debug!(
                            "Control '{}' -> {:?} [{}, {}]",
                            info.name, descriptor.parameter, info.minimum, info.maximum
                        );
                        self.controls.insert(descriptor.parameter, descriptor);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Failed to query control {:#x}: {}", id, e),
            }
        }
    }

    /// Drop the pool and the handle; every outstanding frame goes stale
    fn release_resources(&mut self) {
        self.checked_out.clear();
        self.epoch += 1;
        self.pool = None;
        self.controls.clear();
        self.device.close();
        self.state = CaptureState::Unloaded;
    }

    fn unload(&mut self) {
        let was = self.state;
        if was == CaptureState::Active {
            let _ = self.halt_stream();
        }
        self.release_resources();
        if was != CaptureState::Unloaded {
            info!("Unloaded {}", self.device.name());
        }
    }

    fn start(&mut self, session: SessionId) -> Result<(), CameraError> {
        if self.sessions.insert(session) {
            debug!("{} wants the stream", session);
        }
        self.action = PendingAction::StartRequested;

        match self.state {
            CaptureState::Active => Ok(()),
            CaptureState::Loaded => {
                // Armed on failure too; the next tick retries
                let started = self.start_stream();
                self.poll_interval = Some(if started.is_ok() {
                    self.config.steady_interval()
                } else {
                    self.config.load_interval()
                });
                started
            }
            CaptureState::Unloaded => {
                info!("Camera not loaded, waiting for a source");
                self.poll_interval = Some(self.config.load_interval());
                Ok(())
            }
        }
    }

    fn start_stream(&mut self) -> Result<(), CameraError> {
        if self.state != CaptureState::Loaded {
            return Err(CameraError::InvalidState(self.state));
        }

        let count = self.pool.as_ref().map_or(0, BufferPool::len) as u32;
        for index in 0..count {
            if let Err(e) = self.device.queue_buffer(index) {
                error!("Failed to queue buffer {}: {}", index, e);
                self.release_resources();
                return Err(e.into());
            }
        }

        if let Err(e) = self.device.stream_on() {
            error!("Failed to start streaming: {}", e);
            if let Err(off) = self.device.stream_off() {
                debug!("Stream off after failed start: {}", off);
            }
            return Err(e.into());
        }

        self.checked_out.clear();
        self.epoch += 1;
        self.state = CaptureState::Active;
        info!("Streaming started on {}", self.device.name());
        Ok(())
    }

    fn stop(&mut self, session: SessionId) -> Result<(), CameraError> {
        self.sessions.remove(session);
        self.action = PendingAction::StopRequested;

        let stopped = self.halt_stream();
        match self.sessions.next_owner() {
            Some(next) => {
                debug!("Restarting stream for {}", next);
                let restarted = self.start(next);
                stopped.and(restarted)
            }
            None => stopped,
        }
    }

    fn halt_stream(&mut self) -> Result<(), CameraError> {
        if self.state != CaptureState::Active {
            return Ok(());
        }

        if let Err(e) = self.device.stream_off() {
            error!("Failed to stop streaming: {}", e);
            self.release_resources();
            return Err(e.into());
        }

        self.checked_out.clear();
        self.epoch += 1;
        self.state = CaptureState::Loaded;
        info!("Streaming stopped on {}", self.device.name());
        Ok(())
    }

    fn probe_presence(&mut self) -> bool {
        match self.config.presence {
            PresenceProbe::Signal => match self.device.get_control(cid::VIDEO_DETECT) {
                Ok(value) => value == 1,
                Err(e) => {
                    debug!("Video detect read failed: {}", e);
                    false
                }
            },
            PresenceProbe::Open => {
                self.device.is_open()
                    && self
                        .device
                        .query_capabilities()
                        .map(|caps| caps & CAP_VIDEO_CAPTURE != 0)
                        .unwrap_or(false)
            }
        }
    }

    fn poll_tick(&mut self, events: &mut Vec<CameraEvent>) {
        if !self.device.is_open() {
            if let Err(e) = self.device.open() {
                debug!("Device not available: {}", e);
            }
        }

        let connected = self.probe_presence();

        if self.action == PendingAction::StartRequested {
            match self.state {
                CaptureState::Active if !connected => {
                    warn!("Source signal lost, stopping stream");
                    let _ = self.halt_stream();
                    self.poll_interval = Some(self.config.load_interval());
                }
                CaptureState::Loaded if connected => match self.start_stream() {
                    Ok(()) => self.poll_interval = Some(self.config.steady_interval()),
                    Err(e) => warn!("Failed to restart stream: {}", e),
                },
                CaptureState::Unloaded if connected => {
                    match self.load(events).and_then(|()| self.start_stream()) {
                        Ok(()) => self.poll_interval = Some(self.config.steady_interval()),
                        Err(e) => warn!("Source present but camera failed to start: {}", e),
                    }
                }
                _ => {}
            }
        }

        if connected != self.connected {
            info!(
                "Source {}",
                if connected { "connected" } else { "disconnected" }
            );
            self.connected = connected;
            counter!("camera_connectivity_changes_total").increment(1);
            events.push(CameraEvent::ConnectivityChanged(connected));
        }
    }

    fn dequeue(&mut self, owner: &Arc<Mutex<Inner>>) -> Result<Option<Frame>, CameraError> {
        if self.state != CaptureState::Active {
            return Ok(None);
        }

        let buffer = match self.device.dequeue_buffer() {
            Ok(buffer) => buffer,
            Err(DeviceError::WouldBlock) => return Ok(None),
            Err(e) => {
                warn!("Failed to dequeue buffer: {}", e);
                counter!("camera_dequeue_failures_total").increment(1);
                return Err(e.into());
            }
        };

        let (stride, length) = match self.pool.as_ref().and_then(|p| p.slot(buffer.index)) {
            Some(slot) => (slot.stride(), slot.length()),
            None => {
                warn!("Driver returned unmapped buffer {}, requeueing", buffer.index);
                if let Err(e) = self.device.queue_buffer(buffer.index) {
                    warn!("Failed to requeue buffer {}: {}", buffer.index, e);
                }
                return Ok(None);
            }
        };

        if !self.checked_out.insert(buffer.index) {
            warn!("Driver returned buffer {} while it was checked out", buffer.index);
        }
        counter!("camera_frames_dequeued_total").increment(1);

        Ok(Some(Frame {
            handle: Some(FrameHandle::new(
                Arc::downgrade(owner),
                buffer.index,
                self.epoch,
            )),
            size: self.source_size,
            format: self.pixel_format,
            stride,
            length,
            sequence: buffer.sequence,
            timestamp_ns: buffer.timestamp_ns,
        }))
    }
}

/// Shared handle on the capture pipeline
#[derive(Clone)]
pub struct CameraControl {
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<CameraEvent>,
    next_session: Arc<AtomicU32>,
}

impl CameraControl {
    /// Take ownership of `device`; events arrive on the returned receiver
    pub fn new<D>(device: D, config: CameraConfig) -> (Self, mpsc::Receiver<CameraEvent>)
    where
        D: VideoDevice + 'static,
    {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let control = Self {
            inner: Arc::new(Mutex::new(Inner::new(Box::new(device), config))),
            events: tx,
            next_session: Arc::new(AtomicU32::new(1)),
        };
        (control, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    fn emit(&self, events: Vec<CameraEvent>) {
        for event in events {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => debug!("Event queue full, dropping {:?}", event),
                Err(TrySendError::Closed(_)) => debug!("Event receiver gone"),
            }
        }
    }

    /// Hand out a fresh session id
    pub fn open_session(&self) -> CameraSession {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        CameraSession {
            id,
            control: self.clone(),
        }
    }

    /// Open and configure the device, map the pool and enumerate controls.
    ///
    /// A no-op outside `Unloaded`. On failure everything acquired so far is
    /// released and the state stays `Unloaded`.
    pub fn load(&self) -> Result<(), CameraError> {
        let mut events = Vec::new();
        let result = self.lock().load(&mut events);
        self.emit(events);
        result
    }

    /// Stop streaming if needed, unmap the pool and close the device
    pub fn unload(&self) {
        self.lock().unload();
    }

    /// Register `session` and stream if possible, otherwise wait for a source
    pub fn start(&self, session: SessionId) -> Result<(), CameraError> {
        self.lock().start(session)
    }

    /// Deregister `session` and stop streaming; restarts for any remaining session
    pub fn stop_stream(&self, session: SessionId) -> Result<(), CameraError> {
        self.lock().stop(session)
    }

    /// One hot-plug check
    pub fn on_poll_tick(&self) {
        let mut events = Vec::new();
        self.lock().poll_tick(&mut events);
        self.emit(events);
    }

    /// Dequeue one completed buffer and emit it; `Ok(false)` if none was ready
    pub fn dequeue_frame(&self) -> Result<bool, CameraError> {
        let frame = self.lock().dequeue(&self.inner)?;
        match frame {
            Some(frame) => {
                self.emit(vec![CameraEvent::FrameReady(frame)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write `value` on the 0..=100 scale to the matching device control
    pub fn set_parameter(&self, parameter: CameraParameter, value: u32) -> Result<(), CameraError> {
        if value > MAX_PARAMETER_VALUE {
            return Err(CameraError::InvalidValue(value));
        }

        let mut inner = self.lock();
        let descriptor = inner
            .controls
            .get(&parameter)
            .copied()
            .ok_or(CameraError::Unsupported(parameter))?;
        let native = descriptor.to_native(value);

        match inner.device.set_control(descriptor.control_id, native) {
            Ok(()) | Err(DeviceError::OutOfRange(_)) => {
                debug!("{:?} set to {} (native {})", parameter, value, native);
                Ok(())
            }
            Err(e) => {
                error!("Failed to set {:?}: {}", parameter, e);
                Err(e.into())
            }
        }
    }

    /// Current value on the 0..=100 scale; 0 when unsupported or unreadable
    pub fn parameter(&self, parameter: CameraParameter) -> u32 {
        let mut inner = self.lock();
        let Some(descriptor) = inner.controls.get(&parameter).copied() else {
            return 0;
        };

        match inner.device.get_control(descriptor.control_id) {
            Ok(native) => descriptor.to_normalized(native),
            Err(e) => {
                warn!("Failed to read {:?}: {}", parameter, e);
                0
            }
        }
    }

    /// Whether the loaded device exposes `parameter`
    pub fn is_parameter_supported(&self, parameter: CameraParameter) -> bool {
        self.lock().controls.contains_key(&parameter)
    }

    /// Parameters the loaded device exposes, in declaration order
    pub fn supported_parameters(&self) -> Vec<CameraParameter> {
        self.lock().controls.keys().copied().collect()
    }

    /// Toggle horizontal flip
    pub fn set_mirror(&self, mirror: bool) -> Result<(), CameraError> {
        let value = if mirror { MAX_PARAMETER_VALUE } else { 0 };
        self.set_parameter(CameraParameter::HorizontalMirror, value)
    }

    /// Horizontal flip as last read from the device
    pub fn mirror(&self) -> bool {
        self.parameter(CameraParameter::HorizontalMirror) >= 50
    }

    /// Result of the last presence check
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Dimensions negotiated at the last load
    pub fn source_size(&self) -> FrameSize {
        self.lock().source_size
    }

    /// Format negotiated at the last load; `Invalid` if unrecognized
    pub fn pixel_format(&self) -> PixelFormat {
        self.lock().pixel_format
    }

    /// Current capture state
    pub fn state(&self) -> CaptureState {
        self.lock().state
    }

    /// Last start or stop intent
    pub fn pending_action(&self) -> PendingAction {
        self.lock().action
    }

    /// Sessions currently wanting the stream, lowest id first
    pub fn sessions(&self) -> Vec<SessionId> {
        self.lock().sessions.ids()
    }

    /// Slots held by consumers
    pub fn checked_out_slots(&self) -> Vec<u32> {
        self.lock().checked_out.iter().copied().collect()
    }

    /// Current hot-plug period; `None` until a start has been requested
    pub fn poll_interval(&self) -> Option<Duration> {
        self.lock().poll_interval
    }

    /// How the event loop should wait for the next frame
    pub fn readiness(&self) -> Readiness {
        let inner = self.lock();
        if !inner.state.is_streaming() {
            return Readiness::Idle;
        }
        match inner.device.raw_fd() {
            Some(fd) => Readiness::Descriptor(fd),
            None => Readiness::Polled,
        }
    }
}

/// One consumer's claim on the camera. Dropping it stops its stream.
pub struct CameraSession {
    id: SessionId,
    control: CameraControl,
}

impl CameraSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn control(&self) -> &CameraControl {
        &self.control
    }

    pub fn start(&self) -> Result<(), CameraError> {
        self.control.start(self.id)
    }

    pub fn stop(&self) -> Result<(), CameraError> {
        self.control.stop_stream(self.id)
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        let registered = self.control.lock().sessions.contains(self.id);
        if registered {
            if let Err(e) = self.control.stop_stream(self.id) {
                warn!("Failed to stop stream for {}: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_capture::device::CAP_STREAMING;
    use camera_capture::format::fourcc;
    use camera_capture::{MockDevice, MockFault};
    use proptest::prelude::*;

    fn setup_with(config: CameraConfig) -> (CameraControl, mpsc::Receiver<CameraEvent>, MockDevice) {
        let device = MockDevice::new();
        let (control, events) = CameraControl::new(device.clone(), config);
        (control, events, device)
    }

    fn setup() -> (CameraControl, mpsc::Receiver<CameraEvent>, MockDevice) {
        setup_with(CameraConfig::default())
    }

    fn drain(events: &mut mpsc::Receiver<CameraEvent>) -> Vec<CameraEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn next_frame(events: &mut mpsc::Receiver<CameraEvent>) -> Frame {
        match events.try_recv() {
            Ok(CameraEvent::FrameReady(frame)) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    fn streaming() -> (CameraControl, mpsc::Receiver<CameraEvent>, MockDevice) {
        let (control, mut events, device) = setup();
        control.load().unwrap();
        control.start(SessionId(1)).unwrap();
        drain(&mut events);
        (control, events, device)
    }

    #[test]
    fn test_load_maps_buffers_and_controls() {
        let (control, mut events, device) = setup();
        control.load().unwrap();

        assert_eq!(control.state(), CaptureState::Loaded);
        assert_eq!(control.pixel_format(), PixelFormat::Uyvy);
        assert_eq!(device.input(), Some(1));
        assert_eq!(
            control.supported_parameters(),
            vec![
                CameraParameter::Contrast,
                CameraParameter::Saturation,
                CameraParameter::Brightness,
                CameraParameter::HorizontalMirror,
            ]
        );
        assert!(matches!(
            events.try_recv(),
            Ok(CameraEvent::SourceSizeChanged { width: 720, height: 480 })
        ));
    }

    #[test]
    fn test_load_requires_capture_capability() {
        let (control, _events, device) = setup();
        device.set_capabilities(CAP_STREAMING);

        assert!(matches!(control.load(), Err(CameraError::NoCaptureCapability)));
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!device.is_open());
    }

    #[test]
    fn test_load_rolls_back_on_map_failure() {
        let (control, _events, device) = setup();
        device.inject_fault(MockFault::MapBuffer(2));

        assert!(control.load().is_err());
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!device.is_open());
        assert!(!control.is_parameter_supported(CameraParameter::Contrast));

        control.load().unwrap();
        assert_eq!(control.state(), CaptureState::Loaded);
    }

    #[test]
    fn test_format_failure_leaves_unloaded() {
        let (control, _events, device) = setup();
        device.inject_fault(MockFault::SetFormat);

        assert!(matches!(control.load(), Err(CameraError::Device(_))));
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!device.is_open());
    }

    #[test]
    fn test_stream_off_failure_unloads() {
        let (control, _events, device) = streaming();
        device.inject_fault(MockFault::StreamOff);

        assert!(control.stop_stream(SessionId(1)).is_err());
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!device.is_open());
    }

    #[test]
    fn test_load_when_loaded_is_noop() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        control.load().unwrap();
        assert_eq!(device.open_count(), 1);
    }

    #[test]
    fn test_same_size_emits_no_change() {
        let (control, mut events, device) = setup();
        device.set_resolution(720, 576);
        control.load().unwrap();
        assert!(drain(&mut events).is_empty());
        assert_eq!(control.source_size(), FrameSize { width: 720, height: 576 });
    }

    #[test]
    fn test_unrecognized_format_is_detectable() {
        let (control, mut events, device) = setup();
        device.set_driver_format(fourcc(b"MJPG"));

        control.load().unwrap();
        assert_eq!(control.pixel_format(), PixelFormat::Invalid);
        control.start(SessionId(1)).unwrap();
        drain(&mut events);

        assert!(control.dequeue_frame().unwrap());
        let frame = next_frame(&mut events);
        assert!(frame.is_valid());
        assert!(!frame.is_renderable());
    }

    #[test]
    fn test_start_when_loaded_streams() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        control.start(SessionId(1)).unwrap();

        assert_eq!(control.state(), CaptureState::Active);
        assert!(device.is_streaming());
        assert_eq!(device.queued_indexes(), vec![0, 1, 2, 3]);
        assert_eq!(control.poll_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_dequeue_release_cycle() {
        let (control, mut events, device) = streaming();

        assert!(control.dequeue_frame().unwrap());
        let frame = next_frame(&mut events);
        assert_eq!(frame.handle().map(FrameHandle::index), Some(0));
        assert_eq!(frame.with_data(|data| data.len()), Some(720 * 480 * 2));
        assert_eq!(frame.stride(), 1440);
        assert_eq!(control.checked_out_slots(), vec![0]);
        assert_eq!(device.queued_indexes(), vec![1, 2, 3]);

        frame.release();
        assert!(control.checked_out_slots().is_empty());
        assert_eq!(device.queued_indexes(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_dropped_frame_releases_slot() {
        let (control, mut events, device) = streaming();
        control.dequeue_frame().unwrap();
        drop(next_frame(&mut events));
        assert_eq!(device.queued_indexes(), vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_unmapped_buffer_goes_back_to_driver() {
        let (control, mut events, device) = setup();
        device.set_extra_buffers(2);
        control.load().unwrap();
        control.start(SessionId(1)).unwrap();
        drain(&mut events);

        let mut driver = device.clone();
        driver.queue_buffer(5).unwrap();

        for _ in 0..4 {
            assert!(control.dequeue_frame().unwrap());
        }
        assert!(!control.dequeue_frame().unwrap());
        assert_eq!(device.queued_indexes(), vec![5]);
        assert_eq!(control.checked_out_slots(), vec![0, 1, 2, 3]);
        assert_eq!(drain(&mut events).len(), 4);
        assert!(control.checked_out_slots().is_empty());
    }

    #[test]
    fn test_readiness_follows_stream() {
        let (control, _events, _device) = setup();
        assert_eq!(control.readiness(), Readiness::Idle);

        control.load().unwrap();
        assert_eq!(control.readiness(), Readiness::Idle);

        control.start(SessionId(1)).unwrap();
        assert_eq!(control.readiness(), Readiness::Polled);

        control.unload();
        assert_eq!(control.readiness(), Readiness::Idle);
        assert!(!control.dequeue_frame().unwrap());
    }

    #[test]
    fn test_release_from_another_thread() {
        let (control, mut events, device) = streaming();
        let (tx, rx) = std::sync::mpsc::channel::<Frame>();

        let consumer = std::thread::spawn(move || {
            for (n, frame) in rx.into_iter().enumerate() {
                if n % 2 == 0 {
                    frame.release();
                } else {
                    drop(frame);
                }
            }
        });

        for _ in 0..500 {
            let _ = control.dequeue_frame();
            while let Ok(CameraEvent::FrameReady(frame)) = events.try_recv() {
                tx.send(frame).unwrap();
            }
        }
        drop(tx);
        consumer.join().unwrap();

        assert_eq!(device.double_enqueue_count(), 0);
        assert!(control.checked_out_slots().is_empty());
        assert_eq!(device.queued_indexes().len(), 4);
    }

    #[test]
    fn test_stale_frame_after_restart_is_not_requeued() {
        let (control, mut events, device) = streaming();
        control.dequeue_frame().unwrap();
        let frame = next_frame(&mut events);

        control.stop_stream(SessionId(1)).unwrap();
        assert!(frame.with_data(|data| data.len()).is_none());
        control.start(SessionId(1)).unwrap();

        assert!(!frame.handle().map_or(false, FrameHandle::is_live));
        frame.release();
        assert_eq!(device.double_enqueue_count(), 0);
        assert_eq!(device.queued_indexes(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_release_after_control_dropped() {
        let (control, mut events, _device) = streaming();
        control.dequeue_frame().unwrap();
        let frame = next_frame(&mut events);

        drop(control);
        assert!(frame.with_data(|data| data.len()).is_none());
        frame.release();
    }

    #[test]
    fn test_empty_queue_is_silent() {
        let (control, mut events, _device) = streaming();
        let mut held = Vec::new();
        for _ in 0..4 {
            assert!(control.dequeue_frame().unwrap());
            held.push(next_frame(&mut events));
        }
        assert!(!control.dequeue_frame().unwrap());
        assert_eq!(control.state(), CaptureState::Active);
    }

    #[test]
    fn test_transient_dequeue_failure_keeps_state() {
        let (control, _events, device) = streaming();
        device.inject_fault(MockFault::Dequeue);

        assert!(control.dequeue_frame().is_err());
        assert_eq!(control.state(), CaptureState::Active);
        assert!(control.dequeue_frame().unwrap());
    }

    #[test]
    fn test_full_event_queue_releases_frame() {
        let config = CameraConfig {
            event_capacity: 1,
            ..Default::default()
        };
        let (control, mut events, device) = setup_with(config);
        control.load().unwrap();
        control.start(SessionId(1)).unwrap();
        drain(&mut events);

        assert!(control.dequeue_frame().unwrap());
        assert!(control.dequeue_frame().unwrap());
        assert_eq!(control.checked_out_slots(), vec![0]);
        assert_eq!(device.queued_indexes(), vec![2, 3, 1]);
    }

    #[test]
    fn test_stream_on_failure_stays_loaded() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        device.inject_fault(MockFault::StreamOn);

        assert!(control.start(SessionId(1)).is_err());
        assert_eq!(control.state(), CaptureState::Loaded);
        assert_eq!(control.poll_interval(), Some(Duration::from_millis(200)));

        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(device.double_enqueue_count(), 0);
    }

    #[test]
    fn test_queue_failure_unloads() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        device.inject_fault(MockFault::QueueBuffer(1));

        assert!(control.start(SessionId(1)).is_err());
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert_eq!(control.poll_interval(), Some(Duration::from_millis(200)));

        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(control.sessions(), vec![SessionId(1)]);
    }

    #[test]
    fn test_two_sessions_share_stream() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        control.start(SessionId(1)).unwrap();
        control.start(SessionId(2)).unwrap();

        control.stop_stream(SessionId(1)).unwrap();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(control.sessions(), vec![SessionId(2)]);
        assert_eq!(device.open_count(), 1);

        control.stop_stream(SessionId(2)).unwrap();
        assert_eq!(control.state(), CaptureState::Loaded);
        assert!(!device.is_streaming());
        assert_eq!(control.pending_action(), PendingAction::StopRequested);
    }

    #[test]
    fn test_lowest_remaining_session_restarts() {
        let (control, _events, _device) = setup();
        control.load().unwrap();
        for id in [4, 2, 9] {
            control.start(SessionId(id)).unwrap();
        }
        control.stop_stream(SessionId(9)).unwrap();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(control.pending_action(), PendingAction::StartRequested);
    }

    #[test]
    fn test_start_while_disconnected_then_connect() {
        let (control, mut events, device) = setup();
        device.set_connected(false);

        control.start(SessionId(1)).unwrap();
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert_eq!(control.poll_interval(), Some(Duration::from_millis(200)));

        control.on_poll_tick();
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!control.dequeue_frame().unwrap());
        assert!(drain(&mut events).is_empty());

        device.set_connected(true);
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(control.poll_interval(), Some(Duration::from_secs(1)));

        let connectivity: Vec<bool> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                CameraEvent::ConnectivityChanged(up) => Some(up),
                _ => None,
            })
            .collect();
        assert_eq!(connectivity, vec![true]);

        control.on_poll_tick();
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_signal_loss_and_return() {
        let (control, mut events, device) = setup();
        control.start(SessionId(1)).unwrap();
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        drain(&mut events);

        device.set_connected(false);
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Loaded);
        assert!(!control.is_connected());
        assert_eq!(control.poll_interval(), Some(Duration::from_millis(200)));
        assert!(matches!(
            events.try_recv(),
            Ok(CameraEvent::ConnectivityChanged(false))
        ));

        device.set_connected(true);
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert_eq!(control.poll_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_hot_unplug_recovers() {
        let (control, _events, device) = setup();
        control.start(SessionId(1)).unwrap();
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);

        device.set_present(false);
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Unloaded);

        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Unloaded);

        device.set_present(true);
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert!(control.is_connected());
    }

    #[test]
    fn test_open_presence_probe() {
        let (control, _events, device) = setup_with(CameraConfig {
            presence: PresenceProbe::Open,
            ..Default::default()
        });
        device.set_signal_control(false);

        control.start(SessionId(1)).unwrap();
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Active);
        assert!(control.is_connected());
    }

    #[test]
    fn test_no_start_request_keeps_unloaded() {
        let (control, mut events, _device) = setup();
        control.on_poll_tick();
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(matches!(
            events.try_recv(),
            Ok(CameraEvent::ConnectivityChanged(true))
        ));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let (control, mut events, device) = streaming();
        control.dequeue_frame().unwrap();
        let frame = next_frame(&mut events);

        control.unload();
        assert_eq!(control.state(), CaptureState::Unloaded);
        assert!(!device.is_open());
        assert!(frame.with_data(|data| data.len()).is_none());

        control.unload();
        assert_eq!(control.state(), CaptureState::Unloaded);
        frame.release();
    }

    #[test]
    fn test_reload_enumerates_same_controls() {
        let (control, _events, _device) = setup();
        control.load().unwrap();
        let first = control.supported_parameters();

        control.unload();
        control.load().unwrap();
        assert_eq!(control.supported_parameters(), first);
    }

    #[test]
    fn test_set_parameter_rejects_above_range() {
        let (control, _events, device) = setup();
        control.load().unwrap();

        assert!(matches!(
            control.set_parameter(CameraParameter::Contrast, 101),
            Err(CameraError::InvalidValue(101))
        ));
        assert_eq!(device.control_value(cid::CONTRAST), Some(128));
    }

    #[test]
    fn test_unsupported_parameter_asymmetry() {
        let (control, _events, _device) = setup();
        control.load().unwrap();

        assert!(!control.is_parameter_supported(CameraParameter::Sharpening));
        assert!(matches!(
            control.set_parameter(CameraParameter::Sharpening, 10),
            Err(CameraError::Unsupported(CameraParameter::Sharpening))
        ));
        assert_eq!(control.parameter(CameraParameter::Sharpening), 0);
        assert_eq!(control.parameter(CameraParameter::Denoising), 0);
    }

    #[test]
    fn test_set_parameter_scales_to_native() {
        let (control, _events, device) = setup();
        control.load().unwrap();

        control.set_parameter(CameraParameter::Brightness, 75).unwrap();
        assert_eq!(device.control_value(cid::BRIGHTNESS), Some(63));
        assert_eq!(control.parameter(CameraParameter::Brightness), 75);
    }

    #[test]
    fn test_out_of_range_native_reads_clamped() {
        let (control, _events, device) = setup();
        control.load().unwrap();

        device.force_control_value(cid::SATURATION, 500);
        assert_eq!(control.parameter(CameraParameter::Saturation), 100);
        device.force_control_value(cid::SATURATION, -3);
        assert_eq!(control.parameter(CameraParameter::Saturation), 0);
    }

    #[test]
    fn test_mirror() {
        let (control, _events, device) = setup();
        control.load().unwrap();
        assert!(!control.mirror());

        control.set_mirror(true).unwrap();
        assert_eq!(device.control_value(cid::HFLIP), Some(1));
        assert!(control.mirror());

        control.set_mirror(false).unwrap();
        assert!(!control.mirror());
    }

    #[test]
    fn test_color_temperature_when_present() {
        let (control, _events, device) = setup();
        device.add_control(cid::WHITE_BALANCE_TEMPERATURE, 2800, 6500, 4000, false);
        control.load().unwrap();

        assert!(control.is_parameter_supported(CameraParameter::ColorTemperature));
        control.set_parameter(CameraParameter::ColorTemperature, 100).unwrap();
        assert_eq!(device.control_value(cid::WHITE_BALANCE_TEMPERATURE), Some(6500));
    }

    #[test]
    fn test_session_guard_stops_on_drop() {
        let (control, _events, _device) = setup();
        control.load().unwrap();

        let first = control.open_session();
        let second = control.open_session();
        assert!(first.id() < second.id());

        first.start().unwrap();
        second.start().unwrap();
        drop(first);
        assert_eq!(control.state(), CaptureState::Active);
        drop(second);
        assert_eq!(control.state(), CaptureState::Loaded);
        assert!(control.sessions().is_empty());
    }

    proptest! {
        #[test]
        fn prop_active_iff_sessions_registered(
            ops in prop::collection::vec((any::<bool>(), 1u32..5), 1..40)
        ) {
            let (control, _events, _device) = setup();
            control.load().unwrap();

            for (start, id) in ops {
                if start {
                    control.start(SessionId(id)).unwrap();
                } else {
                    control.stop_stream(SessionId(id)).unwrap();
                }
                let active = control.state() == CaptureState::Active;
                prop_assert_eq!(active, !control.sessions().is_empty());
            }
        }

        #[test]
        fn prop_set_then_read_within_one(value in 0u32..=100) {
            let (control, _events, device) = setup();
            control.load().unwrap();

            control.set_parameter(CameraParameter::Contrast, value).unwrap();
            let native = device.control_value(cid::CONTRAST).unwrap();
            prop_assert!((0..=255).contains(&native));
            let read = control.parameter(CameraParameter::Contrast);
            prop_assert!(read.abs_diff(value) <= 1);
        }

        #[test]
        fn prop_no_double_enqueue(steps in prop::collection::vec(0u8..3, 1..60)) {
            let (control, mut events, device) = streaming();
            let mut held: Vec<Frame> = Vec::new();

            for step in steps {
                match step {
                    0 => {
                        let _ = control.dequeue_frame();
                        while let Ok(CameraEvent::FrameReady(frame)) = events.try_recv() {
                            held.push(frame);
                        }
                    }
                    1 => {
                        if !held.is_empty() {
                            held.remove(0).release();
                        }
                    }
                    _ => {
                        control.stop_stream(SessionId(1)).unwrap();
                        control.start(SessionId(1)).unwrap();
                    }
                }
            }
            drop(held);
            prop_assert_eq!(device.double_enqueue_count(), 0);
        }
    }
}
