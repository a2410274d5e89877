//! Mount configuration stored as JSON.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alignment::AlignmentConfig;
use ephemeris::{Atmosphere, Site};
use hardware::aux::{
    is_network_address, BusConfig, Link, SerialLink, TcpLink, DEFAULT_BAUD, U24_MAX,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoder::EncoderGeometry;
use crate::goto::GotoConfig;
use crate::limits::SoftLimits;
use crate::tracking::TrackingConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How to reach the mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial device path or `host:port` of a WiFi bridge
    pub port: String,
    pub baud: u32,
    /// Whether the serial line echoes written bytes (ignored for TCP)
    pub echo: bool,
    pub timeout_ms: u64,
    pub retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: DEFAULT_BAUD,
            echo: true,
            timeout_ms: 1000,
            retries: 3,
        }
    }
}

impl ConnectionConfig {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            reply_timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
        }
    }

    pub fn open_link(&self) -> io::Result<Box<dyn Link>> {
        if is_network_address(&self.port) {
            Ok(Box::new(TcpLink::connect(&self.port, Duration::from_millis(self.timeout_ms))?))
        } else {
            Ok(Box::new(SerialLink::open(&self.port, self.baud, self.echo)?))
        }
    }
}

/// Everything the controller needs besides a bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub connection: ConnectionConfig,
    pub site: Site,
    pub geometry: EncoderGeometry,
    /// Conditions for refraction correction; `None` disables it
    pub refraction: Option<Atmosphere>,
    pub goto: GotoConfig,
    pub limits: SoftLimits,
    pub tracking: TrackingConfig,
    pub alignment: AlignmentConfig,
    /// Alignment points are saved here after every change when set
    pub alignment_file: Option<PathBuf>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            site: Site::default(),
            geometry: EncoderGeometry::default(),
            refraction: Some(Atmosphere::default()),
            goto: GotoConfig::default(),
            limits: SoftLimits::default(),
            tracking: TrackingConfig::default(),
            alignment: AlignmentConfig::default(),
            alignment_file: None,
        }
    }
}

impl MountConfig {
    /// Load and validate; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: MountConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to JSON file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let positive = |value: f64| value.is_finite() && value > 0.0;

        if !(-90.0..=90.0).contains(&self.site.latitude_deg) {
            return invalid(format!("site latitude {} outside [-90, 90]", self.site.latitude_deg));
        }
        for (name, rev) in [
            ("azimuth", self.geometry.azm_steps_per_rev),
            ("altitude", self.geometry.alt_steps_per_rev),
        ] {
            if rev == 0 || rev > U24_MAX + 1 {
                return invalid(format!("{name} steps per revolution {rev} not in 1..=2^24"));
            }
        }
        let limits = &self.limits;
        if limits.alt_min_deg.is_nan()
            || limits.alt_max_deg.is_nan()
            || limits.alt_min_deg >= limits.alt_max_deg
        {
            return invalid(format!(
                "altitude limits {}..{} are empty",
                limits.alt_min_deg, limits.alt_max_deg
            ));
        }
        if !(limits.az_min_deg.is_finite() && limits.az_max_deg.is_finite()) {
            return invalid("azimuth limits must be finite".to_string());
        }
        if !positive(self.tracking.dt_s) {
            return invalid(format!("tracking dt {} must be positive", self.tracking.dt_s));
        }
        if self.tracking.window_s.is_nan() || self.tracking.window_s < 0.0 {
            return invalid(format!(
                "tracking window {} must not be negative",
                self.tracking.window_s
            ));
        }
        if self.goto.poll_interval_ms == 0 {
            return invalid("GoTo poll interval must be positive".to_string());
        }
        if !positive(self.alignment.sector_size_deg) || self.alignment.max_per_sector == 0 {
            return invalid("alignment sectors must hold at least one point".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goto::ApproachMode;

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("mount.json");
        let mut config = MountConfig::default();
        config.connection.port = "192.168.2.1:2000".to_string();
        config.goto.approach.mode = ApproachMode::TrackingDirection;
        config.tracking.window_s = 30.0;
        config.alignment_file = Some(dir.path().join("alignment.json"));
        config.save(&path).unwrap();

        assert_eq!(MountConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(
            &path,
            r#"{"site": {"latitude_deg": 50.0, "longitude_deg": 20.0},
                "goto": {"approach": {"mode": "Disabled"}}}"#,
        )
        .unwrap();

        let config = MountConfig::load(&path).unwrap();
        assert_eq!(config.site.latitude_deg, 50.0);
        assert_eq!(config.goto.approach.mode, ApproachMode::Disabled);
        assert_eq!(config.goto.approach.azm_offset_steps, 10_000);
        assert_eq!(config.connection.baud, DEFAULT_BAUD);
        assert_eq!(config.tracking, TrackingConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = MountConfig::default();
        config.tracking.dt_s = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MountConfig::default();
        config.limits.alt_min_deg = 50.0;
        config.limits.alt_max_deg = 10.0;
        assert!(config.validate().is_err());

        let mut config = MountConfig::default();
        config.geometry.azm_steps_per_rev = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(MountConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_bus_config_from_connection() {
        let connection = ConnectionConfig {
            timeout_ms: 250,
            retries: 5,
            ..ConnectionConfig::default()
        };
        let bus = connection.bus_config();
        assert_eq!(bus.reply_timeout, Duration::from_millis(250));
        assert_eq!(bus.retries, 5);
    }
}
