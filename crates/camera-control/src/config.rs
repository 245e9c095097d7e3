//! Capture configuration

use std::time::Duration;

use camera_capture::format::{PixelFormat, FOURCC_UYVY};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the hot-plug poll decides a source is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceProbe {
    /// Read the driver's video-detect control; `1` means a signal is present
    #[default]
    Signal,
    /// Treat an open node that answers a capability query as present
    Open,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device node path
    pub device: String,
    /// Video input selected after opening
    pub input_index: i32,
    /// Requested fourcc; the driver may substitute another
    pub preferred_format: String,
    /// Buffers requested from the driver
    pub buffer_count: u32,
    /// Poll period while waiting for a source
    pub load_interval_ms: u64,
    /// Poll period once streaming
    pub steady_interval_ms: u64,
    pub presence: PresenceProbe,
    /// Bound of the event queue
    pub event_capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: camera_capture::DEFAULT_DEVICE.to_string(),
            input_index: 1,
            preferred_format: "UYVY".to_string(),
            buffer_count: camera_capture::DEFAULT_BUFFER_COUNT,
            load_interval_ms: 200,
            steady_interval_ms: 1000,
            presence: PresenceProbe::Signal,
            event_capacity: 16,
        }
    }
}

impl CameraConfig {
    /// Analog decoder front-end on an i.MX6 capture interface
    pub fn imx6() -> Self {
        Self::default()
    }

    /// Generic USB webcam: first input, packed YUYV, no video-detect control
    pub fn webcam() -> Self {
        Self {
            input_index: 0,
            preferred_format: "YUYV".to_string(),
            presence: PresenceProbe::Open,
            ..Default::default()
        }
    }

    pub fn load_interval(&self) -> Duration {
        Duration::from_millis(self.load_interval_ms)
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_millis(self.steady_interval_ms)
    }

    /// Requested fourcc, falling back to UYVY for a malformed name
    pub fn preferred_fourcc(&self) -> u32 {
        match PixelFormat::fourcc_from_str(&self.preferred_format) {
            Some(code) => code,
            None => {
                warn!(
                    "Ignoring malformed pixel format '{}', requesting UYVY",
                    self.preferred_format
                );
                FOURCC_UYVY
            }
        }
    }
}
