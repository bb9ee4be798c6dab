//! Session configuration for pedalsync.
//!
//! This crate provides configuration loading with minimal dependencies so the
//! core library, the binary, and any frontend can share one definition of a
//! session without pulling in the async stack.
//!
//! # Sections
//!
//! - **Sensor** (`SensorConfig`): which sensor backend to use and how to find the device.
//! - **Speed** (`SpeedConfig`): smoothing, hysteresis threshold, units.
//! - **Video** (`VideoConfig`): media backend, file, playback tuning, on-screen display.
//! - **App** (`AppConfig`): logging and teardown bounds.
//!
//! # Config File Locations
//!
//! [`SessionConfig::load`] merges files in order (later wins):
//! 1. `/etc/pedalsync/config.toml` (system)
//! 2. `~/.config/pedalsync/config.toml` (user)
//! 3. `./pedalsync.toml` (local override, replaced by an explicit `--config` path)
//! 4. Environment variables (`PEDALSYNC_*`)
//!
//! [`SessionConfig::load_from`] reads exactly one session file, which is what a
//! frontend does when the user opens a session.
//!
//! # Example Config
//!
//! ```toml
//! [sensor]
//! backend = "simulated"
//! address = "F1:42:D8:DE:35:16"
//! scan_timeout_secs = 10
//!
//! [speed]
//! smoothing_window = 5
//! speed_threshold = 0.25
//! speed_units = "km/h"
//!
//! [video]
//! media_player = "headless"
//! file_path = "~/Videos/ride.mp4"
//! seek_to_position = "01:30"
//! update_interval_sec = 0.25
//! speed_multiplier = 0.8
//!
//! [video.on_screen_display]
//! display_cycle_speed = true
//! display_time_remaining = true
//! ```

pub mod app;
pub mod loader;
pub mod speed;
pub mod video;

pub use app::AppConfig;
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use speed::{SensorConfig, SpeedConfig, SpeedUnits};
pub use video::{parse_seek_position, OsdConfig, VideoConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Complete configuration for one cycling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub speed: SpeedConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub app: AppConfig,
}

impl SessionConfig {
    /// Load configuration from all standard locations.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/pedalsync/config.toml`
    /// 3. `~/.config/pedalsync/config.toml`
    /// 4. `./pedalsync.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load a single session file, apply environment overrides, and validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let table = loader::read_table(path)?;
        let mut config = loader::from_table(table, path)?;
        let mut sources = ConfigSources::default();
        sources.files.push(path.to_path_buf());
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the layered locations and report where values came from.
    ///
    /// If `config_path` is provided it takes precedence over `./pedalsync.toml`.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sensor.validate()?;
        self.speed.validate()?;
        self.video.validate()?;
        self.app.validate()
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        // Sections in a fixed order, floats with a decimal point
        let mut output = String::new();
        let osd = &self.video.on_screen_display;

        output.push_str("# pedalsync session configuration\n\n");

        output.push_str("[sensor]\n");
        output.push_str(&format!("backend = \"{}\"\n", self.sensor.backend));
        output.push_str(&format!("address = \"{}\"\n", self.sensor.address));
        output.push_str(&format!(
            "scan_timeout_secs = {}\n",
            self.sensor.scan_timeout_secs
        ));

        output.push_str("\n[speed]\n");
        output.push_str(&format!(
            "smoothing_window = {}\n",
            self.speed.smoothing_window
        ));
        output.push_str(&format!(
            "speed_threshold = {:?}\n",
            self.speed.speed_threshold
        ));
        output.push_str(&format!(
            "speed_units = \"{}\"\n",
            self.speed.speed_units.label()
        ));

        output.push_str("\n[video]\n");
        output.push_str(&format!("media_player = \"{}\"\n", self.video.media_player));
        output.push_str(&format!(
            "file_path = \"{}\"\n",
            self.video.file_path.display()
        ));
        output.push_str(&format!(
            "window_scale_factor = {:?}\n",
            self.video.window_scale_factor
        ));
        output.push_str(&format!(
            "seek_to_position = \"{}\"\n",
            self.video.seek_to_position
        ));
        output.push_str(&format!(
            "update_interval_sec = {:?}\n",
            self.video.update_interval_sec
        ));
        output.push_str(&format!(
            "speed_multiplier = {:?}\n",
            self.video.speed_multiplier
        ));

        output.push_str("\n[video.on_screen_display]\n");
        output.push_str(&format!(
            "display_cycle_speed = {}\n",
            osd.display_cycle_speed
        ));
        output.push_str(&format!(
            "display_playback_speed = {}\n",
            osd.display_playback_speed
        ));
        output.push_str(&format!(
            "display_time_remaining = {}\n",
            osd.display_time_remaining
        ));
        output.push_str(&format!("font_size = {}\n", osd.font_size));
        output.push_str(&format!("margin_x = {}\n", osd.margin_x));
        output.push_str(&format!("margin_y = {}\n", osd.margin_y));

        output.push_str("\n[app]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.app.log_level));
        output.push_str(&format!(
            "shutdown_timeout_ms = {}\n",
            self.app.shutdown_timeout_ms
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.speed.smoothing_window, 5);
        assert_eq!(config.speed.speed_units, SpeedUnits::Kmh);
        assert_eq!(config.video.media_player, "headless");
        assert_eq!(config.sensor.backend, "simulated");
    }

    #[test]
    fn test_to_toml() {
        let config = SessionConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[sensor]"));
        assert!(toml.contains("[speed]"));
        assert!(toml.contains("[video.on_screen_display]"));
        assert!(toml.contains("speed_units = \"km/h\""));
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = SessionConfig::default();
        config.speed.speed_units = SpeedUnits::Mph;
        config.video.speed_multiplier = 0.6;
        let file = write_config(&config.to_toml());

        let loaded = SessionConfig::load_from(file.path()).unwrap();
        assert_eq!(loaded.speed.speed_units, SpeedUnits::Mph);
        assert_eq!(loaded.video.speed_multiplier, 0.6);
    }

    #[test]
    fn test_load_from_applies_defaults() {
        let file = write_config(
            r#"
[video]
file_path = "/videos/alps.mp4"
"#,
        );

        let config = SessionConfig::load_from(file.path()).unwrap();
        assert_eq!(config.video.file_path, PathBuf::from("/videos/alps.mp4"));
        assert_eq!(config.video.update_interval_sec, 0.25);
        assert_eq!(config.speed.speed_threshold, 0.25);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = SessionConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_load_from_rejects_bad_toml() {
        let file = write_config("[speed\nsmoothing_window = 3");
        let err = SessionConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_rejects_out_of_range() {
        let file = write_config(
            r#"
[video]
update_interval_sec = 10.0
"#,
        );
        let err = SessionConfig::load_from(file.path()).unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "video.update_interval_sec"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_with_sources_from_override() {
        let file = write_config(
            r#"
[speed]
speed_units = "mph"
"#,
        );
        let (config, sources) = SessionConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.speed.speed_units, SpeedUnits::Mph);
        assert_eq!(sources.files.last().map(PathBuf::as_path), Some(file.path()));
    }
}
