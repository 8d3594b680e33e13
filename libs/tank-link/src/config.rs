use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::Error, paths};

/// Fire-enable threshold, in the sensor's distance unit. Call sites in the
/// field have used both 20 and 50; deployments override it in `[gate]`.
pub const DEFAULT_FIRE_THRESHOLD: f64 = 20.0;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub gate: GateConfig,
    pub fire: FireConfig,
    pub movement: MovementConfig,
    pub capture: CaptureConfig,
    pub classifier: ClassifierConfig,
    pub camera: CameraConfig,
    pub report: ReportConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GateConfig {
    pub threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FIRE_THRESHOLD,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FireConfig {
    pub cooldown_ms: u64,
}

impl Default for FireConfig {
    fn default() -> Self {
        Self { cooldown_ms: 5000 }
    }
}

impl FireConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MovementConfig {
    pub min_interval_ms: u64,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
        }
    }
}

impl MovementConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub input_size: u32,
    pub retry_attempts: u32,
    pub retry_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            retry_attempts: 5,
            retry_interval_ms: 500,
            fetch_timeout_ms: 3000,
            jpeg_quality: 85,
        }
    }
}

impl CaptureConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ClassifierConfig {
    /// JSON weights for [`crate::classifier::LinearModel`]. Without one the
    /// model never loads and analysis reports `Unknown`.
    pub model: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CameraConfig {
    pub ip_path: String,
    pub stream_port: u16,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            ip_path: paths::CAMERA_IP.to_string(),
            stream_port: 81,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReportConfig {
    pub status: String,
    pub capture_status: String,
    /// chrono format string; when set, detailed reports carry a formatted
    /// local time instead of epoch milliseconds.
    pub time_format: Option<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            status: "completed".to_string(),
            capture_status: "captured".to_string(),
            time_format: None,
        }
    }
}

impl Config {
    /// Loads the first config file found: `path`, then `$TANK_CONFIG`
    /// (default `/etc/tank/console.toml`), then `./tank.toml`. Falls back to
    /// the built-in defaults when none exists.
    pub fn parse(path: Option<PathBuf>) -> Result<Self, Error> {
        let config_paths = [
            std::env::var("TANK_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc/tank/console.toml")),
            PathBuf::from("./tank.toml"),
        ];
        if let Some(path) = path {
            let config = std::fs::read_to_string(&path)?;
            info!(?path, "loaded config");
            return Self::from_toml(&config);
        }
        for path in config_paths {
            let Ok(config) = std::fs::read_to_string(&path) else {
                continue;
            };
            info!(?path, "loaded config");
            return Self::from_toml(&config);
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_toml(config: &str) -> Result<Self, Error> {
        Ok(toml::from_str(config)?)
    }
}
