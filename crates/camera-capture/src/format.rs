//! Pixel format tags and negotiated capture formats

use serde::{Deserialize, Serialize};

/// Build a V4L2 fourcc code from its four ASCII characters
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

pub const FOURCC_YUYV: u32 = fourcc(b"YUYV");
pub const FOURCC_UYVY: u32 = fourcc(b"UYVY");
pub const FOURCC_YUV444: u32 = fourcc(b"Y444");
pub const FOURCC_YUV420: u32 = fourcc(b"YU12");
pub const FOURCC_YVU420: u32 = fourcc(b"YV12");
pub const FOURCC_NV12: u32 = fourcc(b"NV12");
pub const FOURCC_NV21: u32 = fourcc(b"NV21");

/// Pixel layout of a captured frame, as the renderer understands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Driver returned a code with no known layout
    #[default]
    Invalid,
    Ayuv444,
    Ayuv444Premultiplied,
    Yuv444,
    Yuv420P,
    Yv12,
    Uyvy,
    Yuyv,
    Nv12,
    Nv21,
}

impl PixelFormat {
    /// Map a driver fourcc to a tag; unknown codes become `Invalid`
    pub fn from_fourcc(code: u32) -> Self {
        match code {
            FOURCC_YUYV => PixelFormat::Yuyv,
            FOURCC_UYVY => PixelFormat::Uyvy,
            FOURCC_YUV444 => PixelFormat::Yuv444,
            FOURCC_YUV420 => PixelFormat::Yuv420P,
            FOURCC_YVU420 => PixelFormat::Yv12,
            FOURCC_NV12 => PixelFormat::Nv12,
            FOURCC_NV21 => PixelFormat::Nv21,
            _ => PixelFormat::Invalid,
        }
    }

    /// Parse a four character code such as `"UYVY"`
    pub fn fourcc_from_str(name: &str) -> Option<u32> {
        let bytes: [u8; 4] = name.as_bytes().try_into().ok()?;
        Some(fourcc(&bytes))
    }

    /// Three-plane 4:2:0 layouts
    pub fn is_planar_420(self) -> bool {
        matches!(self, PixelFormat::Yuv420P | PixelFormat::Yv12)
    }

    pub fn is_valid(self) -> bool {
        self != PixelFormat::Invalid
    }
}

/// Format the capture path asks the driver for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Requested fourcc; the driver may substitute another
    pub fourcc: u32,
    /// Zero lets the driver pick its native width
    pub width: u32,
    /// Zero lets the driver pick its native height
    pub height: u32,
}

/// Format the driver actually settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the first plane
    pub bytes_per_line: u32,
    /// Driver-reported image size in bytes
    pub size_image: u32,
}

impl NegotiatedFormat {
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_fourcc(self.fourcc)
    }

    /// Slot length exposed to consumers.
    ///
    /// Planar 4:2:0 buffers are `stride * height * 1.5`, chroma planes packed
    /// right after luma. Other layouts use the driver-reported length.
    pub fn slot_length(&self, driver_length: usize) -> usize {
        if self.pixel_format().is_planar_420() {
            self.bytes_per_line as usize * self.height as usize * 3 / 2
        } else {
            driver_length
        }
    }
}
