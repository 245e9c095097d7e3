//! Daemon configuration

use std::collections::BTreeMap;

use camera_control::{CameraConfig, CameraParameter};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Capture backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kernel video-capture node
    #[default]
    V4l2,
    /// In-memory driver, no hardware needed
    Mock,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub logging: LoggingConfig,
    pub backend: Backend,
    /// Prometheus listen address, e.g. `0.0.0.0:9100`
    pub metrics_addr: Option<String>,
    pub camera: CameraConfig,
    /// Values applied whenever the camera comes up
    pub parameters: BTreeMap<CameraParameter, u32>,
    pub mirror: bool,
}

impl DaemonConfig {
    /// Environment prefix, e.g. `CAMERA_BACKEND=mock`
    pub const ENV_PREFIX: &'static str = "CAMERA";

    /// Load from an optional file, then `CAMERA_*` environment overrides.
    ///
    /// Nested keys use a double underscore: `CAMERA_CAMERA__DEVICE`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
