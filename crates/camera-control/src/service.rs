//! Capture event loop
//!
//! One background thread drives the two trigger sources of the state
//! machine: readability of the device descriptor (a frame is ready) and the
//! hot-plug timer.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::{CameraControl, Readiness};
use crate::event::CameraEvent;

/// Longest single wait between shutdown checks
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Dequeue cadence for backends without a descriptor
const POLLED_FRAME_PERIOD: Duration = Duration::from_millis(40);

/// Async capture service for tokio
pub struct CaptureService {
    receiver: mpsc::Receiver<CameraEvent>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureService {
    /// Spawn the event loop for `control`; `events` is the receiver
    /// `CameraControl::new` returned
    pub fn spawn(
        control: CameraControl,
        events: mpsc::Receiver<CameraEvent>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let thread = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || run(control, shutdown_clone))?;

        Ok(Self {
            receiver: events,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Receive the next event
    pub async fn next(&mut self) -> Option<CameraEvent> {
        self.receiver.recv().await
    }

    /// Stop the loop and wait for the thread to exit
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(control: CameraControl, shutdown: Arc<AtomicBool>) {
    info!("Capture loop started");
    let mut last_tick = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        let wait = match control.poll_interval() {
            Some(interval) => {
                let elapsed = last_tick.elapsed();
                if elapsed >= interval {
                    control.on_poll_tick();
                    last_tick = Instant::now();
                    continue;
                }
                (interval - elapsed).min(MAX_WAIT)
            }
            None => MAX_WAIT,
        };

        match control.readiness() {
            Readiness::Idle => std::thread::sleep(wait),
            Readiness::Polled => {
                std::thread::sleep(wait.min(POLLED_FRAME_PERIOD));
                dispatch_frame(&control);
            }
            // The descriptor may be closed or reused by an unload while we wait
            Readiness::Descriptor(fd) => match wait_readable(fd, wait) {
                Ok(true) if control.readiness() == Readiness::Descriptor(fd) => {
                    dispatch_frame(&control)
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Waiting on capture descriptor failed: {}", e);
                    std::thread::sleep(wait);
                }
            },
        }
    }

    info!("Capture loop stopped");
}

fn dispatch_frame(control: &CameraControl) {
    if let Err(e) = control.dequeue_frame() {
        debug!("Skipping frame: {}", e);
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// Error and hang-up conditions are reported as `Err`.
fn wait_readable(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if ret == 0 {
        return Ok(false);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(std::io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(pfd.revents & libc::POLLIN != 0)
}
