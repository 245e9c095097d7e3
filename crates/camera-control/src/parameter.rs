//! Normalized image parameters and their driver controls

use camera_capture::device::cid;
use camera_capture::ControlInfo;
use serde::{Deserialize, Serialize};

/// Largest normalized parameter value
pub const MAX_PARAMETER_VALUE: u32 = 100;

/// Image adjustments exposed on a 0..=100 scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraParameter {
    WhiteBalancePreset,
    ColorTemperature,
    Contrast,
    Saturation,
    Brightness,
    Sharpening,
    Denoising,
    HorizontalMirror,
}

impl CameraParameter {
    pub const ALL: [CameraParameter; 8] = [
        CameraParameter::WhiteBalancePreset,
        CameraParameter::ColorTemperature,
        CameraParameter::Contrast,
        CameraParameter::Saturation,
        CameraParameter::Brightness,
        CameraParameter::Sharpening,
        CameraParameter::Denoising,
        CameraParameter::HorizontalMirror,
    ];

    /// Parameter driven by a driver control id, if any
    pub fn from_control_id(id: u32) -> Option<Self> {
        match id {
            cid::BRIGHTNESS => Some(CameraParameter::Brightness),
            cid::CONTRAST => Some(CameraParameter::Contrast),
            cid::SATURATION => Some(CameraParameter::Saturation),
            cid::HFLIP => Some(CameraParameter::HorizontalMirror),
            cid::SHARPNESS => Some(CameraParameter::Sharpening),
            cid::WHITE_BALANCE_TEMPERATURE => Some(CameraParameter::ColorTemperature),
            _ => None,
        }
    }
}

/// A supported parameter bound to the driver control backing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDescriptor {
    pub parameter: CameraParameter,
    pub control_id: u32,
    pub minimum: i32,
    pub maximum: i32,
}

impl ControlDescriptor {
    /// Bind an enumerated driver control; `None` if it maps to no parameter
    pub fn from_info(info: &ControlInfo) -> Option<Self> {
        CameraParameter::from_control_id(info.id).map(|parameter| Self {
            parameter,
            control_id: info.id,
            minimum: info.minimum,
            maximum: info.maximum,
        })
    }

    /// Scale a 0..=100 value onto the control range, rounding to nearest
    pub fn to_native(&self, value: u32) -> i32 {
        let (low, high) = self.bounds();
        let range = high - low;
        let scaled = (f64::from(value) * range as f64 / f64::from(MAX_PARAMETER_VALUE)).round();
        (scaled as i64 + low).clamp(low, high) as i32
    }

    /// Scale a raw control value back to 0..=100.
    ///
    /// Values above the range read as 100, below as 0. A degenerate range
    /// reads as 0.
    pub fn to_normalized(&self, native: i32) -> u32 {
        let (low, high) = self.bounds();
        let native = i64::from(native);
        if native > high {
            return MAX_PARAMETER_VALUE;
        }
        if native < low || high == low {
            return 0;
        }
        let ratio = (native - low) as f64 / (high - low) as f64;
        (ratio * f64::from(MAX_PARAMETER_VALUE)).round() as u32
    }

    fn bounds(&self) -> (i64, i64) {
        let low = i64::from(self.minimum.min(self.maximum));
        let high = i64::from(self.minimum.max(self.maximum));
        (low, high)
    }
}
