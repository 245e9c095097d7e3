//! Camera Daemon - Main Entry Point

use camera_daemon::{init_logging, init_metrics, run, DaemonConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1);
    let config = DaemonConfig::load(path.as_deref())?;

    init_logging(&config.logging)?;
    info!("=== Camera Daemon v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Backend {:?}, device {}", config.backend, config.camera.device);

    init_metrics(&config)?;
    run(config).await
}
