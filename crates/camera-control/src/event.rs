//! Notifications delivered to the consumer

use crate::frame::Frame;

/// Event emitted by the capture pipeline
#[derive(Debug)]
pub enum CameraEvent {
    /// A filled buffer; the receiver owns it until released or dropped
    FrameReady(Frame),
    /// The source appeared or went away
    ConnectivityChanged(bool),
    /// The negotiated source size differs from the previous one
    SourceSizeChanged { width: u32, height: u32 },
}
