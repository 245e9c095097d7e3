//! Camera Daemon
//!
//! Wires the capture pipeline into a process: configuration, logging,
//! optional Prometheus export and a reference consumer that keeps the
//! newest frame on display.

pub mod config;
pub mod presenter;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use camera_capture::{MockDevice, V4l2Device, VideoDevice};
use camera_control::{CameraControl, CameraEvent, CameraParameter, CaptureService};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

pub use config::{Backend, DaemonConfig, LoggingConfig};
pub use presenter::{FrameMailbox, Presenter};

/// Display refresh period of the reference consumer
const REFRESH_PERIOD: Duration = Duration::from_millis(16);

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = Level::from_str(&config.level).unwrap_or(Level::INFO);

    let result = if config.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    result.context("Failed to set tracing subscriber")
}

/// Install the Prometheus exporter if an address is configured
pub fn init_metrics(config: &DaemonConfig) -> anyhow::Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(());
    };
    let addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics address '{}'", addr))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Serving metrics on {}", addr);
    Ok(())
}

/// Build the configured capture backend
pub fn build_device(config: &DaemonConfig) -> Box<dyn VideoDevice> {
    match config.backend {
        Backend::V4l2 => Box::new(V4l2Device::new(config.camera.device.clone())),
        Backend::Mock => Box::new(MockDevice::new()),
    }
}

/// Push the configured parameter values to the device
pub fn apply_parameters(control: &CameraControl, config: &DaemonConfig) {
    for (&parameter, &value) in &config.parameters {
        if let Err(e) = control.set_parameter(parameter, value) {
            warn!("Could not apply {:?} = {}: {}", parameter, value, e);
        }
    }
    if control.is_parameter_supported(CameraParameter::HorizontalMirror) {
        if let Err(e) = control.set_mirror(config.mirror) {
            warn!("Could not apply mirror: {}", e);
        }
    }
}

/// Run the capture pipeline until Ctrl-C
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let (control, events) = CameraControl::new(build_device(&config), config.camera.clone());

    match control.load() {
        Ok(()) => apply_parameters(&control, &config),
        Err(e) => info!("Camera not ready yet ({}), waiting for it", e),
    }

    let session = control.open_session();
    if let Err(e) = session.start() {
        warn!("Initial start failed: {}", e);
    }

    let mut service = CaptureService::spawn(control.clone(), events)
        .context("Failed to spawn capture thread")?;

    let mut mailbox = FrameMailbox::new();
    let mut presenter = Presenter::new();
    let mut refresh = tokio::time::interval(REFRESH_PERIOD);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = service.next() => match event {
                Some(CameraEvent::FrameReady(frame)) => {
                    mailbox.post(frame);
                }
                Some(CameraEvent::ConnectivityChanged(true)) => {
                    info!("Camera connected");
                    apply_parameters(&control, &config);
                }
                Some(CameraEvent::ConnectivityChanged(false)) => {
                    info!("Camera disconnected");
                    mailbox.clear();
                    presenter.clear();
                }
                Some(CameraEvent::SourceSizeChanged { width, height }) => {
                    info!("Source size is now {}x{}", width, height);
                }
                None => break,
            },
            _ = refresh.tick() => {
                presenter.refresh(&mut mailbox);
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    mailbox.clear();
    presenter.clear();
    info!("Presented {} frames", presenter.presented());

    service.shutdown();
    drop(session);
    control.unload();
    Ok(())
}
