//! Sensor and speed configuration.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Units the sensor reports speed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpeedUnits {
    #[default]
    #[serde(rename = "km/h", alias = "kmh", alias = "kph")]
    Kmh,
    #[serde(rename = "mph")]
    Mph,
}

impl SpeedUnits {
    /// Factor that turns a reading in these units into its km/h equivalent when divided by.
    pub fn conversion_factor(self) -> f64 {
        match self {
            SpeedUnits::Kmh => 1.0,
            SpeedUnits::Mph => 0.621371,
        }
    }

    /// Short label used in config files and on-screen text.
    pub fn label(self) -> &'static str {
        match self {
            SpeedUnits::Kmh => "km/h",
            SpeedUnits::Mph => "mph",
        }
    }
}

impl std::str::FromStr for SpeedUnits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "km/h" | "kmh" | "kph" => Ok(SpeedUnits::Kmh),
            "mph" => Ok(SpeedUnits::Mph),
            other => Err(ConfigError::invalid(
                "speed.speed_units",
                format!("expected \"km/h\" or \"mph\", got \"{other}\""),
            )),
        }
    }
}

/// How the sensor is located.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Registered sensor backend name.
    /// Default: simulated
    #[serde(default = "SensorConfig::default_backend")]
    pub backend: String,

    /// Device address to connect to. Empty matches the first speed sensor found.
    #[serde(default)]
    pub address: String,

    /// Upper bound on the scan phase of the connect sequence.
    /// Default: 10
    #[serde(default = "SensorConfig::default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl SensorConfig {
    fn default_backend() -> String {
        "simulated".to_string()
    }

    fn default_scan_timeout_secs() -> u64 {
        10
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.trim().is_empty() {
            return Err(ConfigError::invalid("sensor.backend", "must not be empty"));
        }
        if self.scan_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "sensor.scan_timeout_secs",
                "must be at least 1 second",
            ));
        }
        Ok(())
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            address: String::new(),
            scan_timeout_secs: Self::default_scan_timeout_secs(),
        }
    }
}

/// Smoothing and hysteresis settings applied to sensor speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedConfig {
    /// Number of samples in the rolling average.
    /// Default: 5
    #[serde(default = "SpeedConfig::default_smoothing_window")]
    pub smoothing_window: usize,

    /// Minimum change in smoothed speed before the playback rate is touched.
    /// Default: 0.25
    #[serde(default = "SpeedConfig::default_speed_threshold")]
    pub speed_threshold: f64,

    /// Units the sensor reports in.
    /// Default: km/h
    #[serde(default)]
    pub speed_units: SpeedUnits,
}

impl SpeedConfig {
    fn default_smoothing_window() -> usize {
        5
    }

    fn default_speed_threshold() -> f64 {
        0.25
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=25).contains(&self.smoothing_window) {
            return Err(ConfigError::invalid(
                "speed.smoothing_window",
                format!("{} is outside 1..=25", self.smoothing_window),
            ));
        }
        if !(0.0..=10.0).contains(&self.speed_threshold) {
            return Err(ConfigError::invalid(
                "speed.speed_threshold",
                format!("{} is outside 0.0..=10.0", self.speed_threshold),
            ));
        }
        Ok(())
    }
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            smoothing_window: Self::default_smoothing_window(),
            speed_threshold: Self::default_speed_threshold(),
            speed_units: SpeedUnits::default(),
        }
    }
}
