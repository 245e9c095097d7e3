//! Capture lifecycle states

use serde::Serialize;

/// Where the capture pipeline is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CaptureState {
    /// No device resources held
    #[default]
    Unloaded,
    /// Device configured and buffers mapped, not streaming
    Loaded,
    /// Streaming; buffers cycle between driver and consumers
    Active,
}

impl CaptureState {
    pub fn is_streaming(self) -> bool {
        self == CaptureState::Active
    }
}

/// Last start/stop intent, consulted by the hot-plug poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PendingAction {
    #[default]
    Idle,
    StartRequested,
    StopRequested,
}
