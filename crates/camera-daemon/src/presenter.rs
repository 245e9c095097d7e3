//! Reference frame consumer
//!
//! Frames arrive faster than a display may draw them. `FrameMailbox` keeps
//! only the newest undisplayed frame; `Presenter` swaps it in as the current
//! frame on each refresh and gives the previous one back to the driver.

use camera_control::Frame;
use metrics::counter;
use tracing::{debug, warn};

/// Single-slot mailbox; a newer frame replaces and releases the older one
#[derive(Debug, Default)]
pub struct FrameMailbox {
    next: Option<Frame>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` for the next refresh.
    ///
    /// Returns false for a frame that cannot be drawn; such frames are
    /// released immediately.
    pub fn post(&mut self, frame: Frame) -> bool {
        if !frame.is_renderable() {
            warn!("Rejecting frame with format {:?}", frame.format());
            counter!("camera_frames_rejected_total").increment(1);
            frame.release();
            return false;
        }

        if let Some(stale) = self.next.replace(frame) {
            debug!("Dropping undisplayed frame {}", stale.sequence());
            counter!("camera_frames_skipped_total").increment(1);
            stale.release();
        }
        true
    }

    /// A frame is waiting to be displayed
    pub fn has_unconsumed(&self) -> bool {
        self.next.is_some()
    }

    pub fn take(&mut self) -> Option<Frame> {
        self.next.take()
    }

    /// Release whatever is waiting
    pub fn clear(&mut self) {
        if let Some(frame) = self.next.take() {
            frame.release();
        }
    }
}

/// Current/next double buffer in front of a display
#[derive(Debug, Default)]
pub struct Presenter {
    current: Option<Frame>,
    presented: u64,
}

impl Presenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in the mailbox frame if there is one; returns true if the
    /// displayed frame changed
    pub fn refresh(&mut self, mailbox: &mut FrameMailbox) -> bool {
        let Some(next) = mailbox.take() else {
            return false;
        };

        if let Some(previous) = self.current.replace(next) {
            previous.release();
        }
        self.presented += 1;
        counter!("camera_frames_presented_total").increment(1);
        true
    }

    /// Frame currently on screen
    pub fn current(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    /// Number of frames swapped in so far
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Release the displayed frame
    pub fn clear(&mut self) {
        if let Some(frame) = self.current.take() {
            frame.release();
        }
    }
}
