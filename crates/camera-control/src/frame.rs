//! Frames handed to consumers
//!
//! A `Frame` owns at most one `FrameHandle`, and the handle is the
//! consumer's claim on a pool slot. Releasing or dropping the handle gives
//! the slot back to the driver. Handles issued before a stream stop are
//! stale afterwards: their data reads as `None` and releasing them does
//! nothing.

use std::fmt;
use std::sync::{Mutex, Weak};

use camera_capture::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::control::{lock_inner, Inner};

/// Source frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Size reported before any format has been negotiated
pub const DEFAULT_SOURCE_SIZE: FrameSize = FrameSize {
    width: 720,
    height: 576,
};

impl Default for FrameSize {
    fn default() -> Self {
        DEFAULT_SOURCE_SIZE
    }
}

/// Claim on one dequeued pool slot
pub struct FrameHandle {
    owner: Weak<Mutex<Inner>>,
    index: u32,
    epoch: u64,
    released: bool,
}

impl FrameHandle {
    pub(crate) fn new(owner: Weak<Mutex<Inner>>, index: u32, epoch: u64) -> Self {
        Self {
            owner,
            index,
            epoch,
            released: false,
        }
    }

    /// Pool slot this handle refers to
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Whether the slot is still checked out under this handle's stream
    pub fn is_live(&self) -> bool {
        match self.owner.upgrade() {
            Some(inner) => {
                let live = lock_inner(&inner).is_checked_out(self.index, self.epoch);
                live
            }
            None => false,
        }
    }

    /// Run `f` over the slot's bytes.
    ///
    /// Returns `None` for a stale handle. `f` runs with the capture lock
    /// held and must not call back into `CameraControl`.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let inner = self.owner.upgrade()?;
        let guard = lock_inner(&inner);
        let result = guard.checked_out_data(self.index, self.epoch).map(f);
        result
    }

    /// Give the slot back to the driver
    pub fn release(mut self) {
        self.requeue();
    }

    fn requeue(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(inner) = self.owner.upgrade() {
            lock_inner(&inner).requeue(self.index, self.epoch);
        }
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.requeue();
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("index", &self.index)
            .field("epoch", &self.epoch)
            .field("released", &self.released)
            .finish()
    }
}

/// One captured image plus its layout
#[derive(Debug)]
pub struct Frame {
    pub(crate) handle: Option<FrameHandle>,
    pub(crate) size: FrameSize,
    pub(crate) format: PixelFormat,
    pub(crate) stride: u32,
    pub(crate) length: usize,
    pub(crate) sequence: u32,
    pub(crate) timestamp_ns: u64,
}

impl Frame {
    /// A frame with no slot behind it
    pub fn invalid() -> Self {
        Self {
            handle: None,
            size: FrameSize::default(),
            format: PixelFormat::Invalid,
            stride: 0,
            length: 0,
            sequence: 0,
            timestamp_ns: 0,
        }
    }

    /// Carries a slot handle
    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    /// Carries a slot handle in a layout a renderer can draw
    pub fn is_renderable(&self) -> bool {
        self.is_valid() && self.format.is_valid()
    }

    pub fn handle(&self) -> Option<&FrameHandle> {
        self.handle.as_ref()
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per line
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Frame length in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    /// Driver sequence number
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// See [`FrameHandle::with_data`]
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.handle.as_ref()?.with_data(f)
    }

    /// Release the slot, if any
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::invalid()
    }
}
