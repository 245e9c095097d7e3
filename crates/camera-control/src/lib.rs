//! Camera Control
//!
//! Capture pipeline core built on the `camera-capture` device layer:
//! - `CameraControl`: Unloaded / Loaded / Active state machine with hot-plug polling
//! - `SessionArbiter`: keeps the stream running while any session wants it
//! - `ControlDescriptor`: maps 0..=100 parameters onto driver control ranges
//! - `Frame` / `FrameHandle`: zero-copy frames that give their slot back on release
//! - `CaptureService`: background event loop feeding `CameraEvent`s to tokio

pub mod config;
pub mod control;
pub mod event;
pub mod frame;
pub mod parameter;
pub mod service;
pub mod session;
pub mod state;

use camera_capture::DeviceError;
use thiserror::Error;

pub use config::{CameraConfig, PresenceProbe};
pub use control::{CameraControl, CameraSession, Readiness};
pub use event::CameraEvent;
pub use frame::{Frame, FrameHandle, FrameSize, DEFAULT_SOURCE_SIZE};
pub use parameter::{CameraParameter, ControlDescriptor, MAX_PARAMETER_VALUE};
pub use service::CaptureService;
pub use session::{SessionArbiter, SessionId};
pub use state::{CaptureState, PendingAction};

/// Camera control errors
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device does not support video capture")]
    NoCaptureCapability,

    #[error("Parameter value {0} exceeds 100")]
    InvalidValue(u32),

    #[error("Parameter {0:?} not supported by the device")]
    Unsupported(CameraParameter),

    #[error("Operation not valid while {0:?}")]
    InvalidState(CaptureState),
}
