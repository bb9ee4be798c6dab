//! Video playback and on-screen display configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ConfigError;

/// Which live metrics are drawn over the video, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsdConfig {
    #[serde(default)]
    pub display_cycle_speed: bool,

    #[serde(default)]
    pub display_playback_speed: bool,

    #[serde(default)]
    pub display_time_remaining: bool,

    /// Default: 40
    #[serde(default = "OsdConfig::default_font_size")]
    pub font_size: u32,

    /// Default: 25
    #[serde(default = "OsdConfig::default_margin")]
    pub margin_x: u32,

    /// Default: 25
    #[serde(default = "OsdConfig::default_margin")]
    pub margin_y: u32,
}

impl OsdConfig {
    fn default_font_size() -> u32 {
        40
    }

    fn default_margin() -> u32 {
        25
    }

    /// True when any overlay line is switched on.
    pub fn enabled(&self) -> bool {
        self.display_cycle_speed || self.display_playback_speed || self.display_time_remaining
    }
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            display_cycle_speed: false,
            display_playback_speed: false,
            display_time_remaining: false,
            font_size: Self::default_font_size(),
            margin_x: Self::default_margin(),
            margin_y: Self::default_margin(),
        }
    }
}

/// Media backend and playback tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Registered media backend name.
    /// Default: headless
    #[serde(default = "VideoConfig::default_media_player")]
    pub media_player: String,

    /// Video file to play.
    /// Default: ride.mp4
    #[serde(default = "VideoConfig::default_file_path")]
    pub file_path: PathBuf,

    /// Fraction of the screen the player window occupies.
    /// Default: 1.0
    #[serde(default = "VideoConfig::default_window_scale_factor")]
    pub window_scale_factor: f64,

    /// Start position, "MM:SS" or "HH:MM:SS".
    /// Default: 00:00
    #[serde(default = "VideoConfig::default_seek_to_position")]
    pub seek_to_position: String,

    /// Seconds between playback rate updates.
    /// Default: 0.25
    #[serde(default = "VideoConfig::default_update_interval_sec")]
    pub update_interval_sec: f64,

    /// Scales sensor speed into playback rate.
    /// Default: 1.0
    #[serde(default = "VideoConfig::default_speed_multiplier")]
    pub speed_multiplier: f64,

    #[serde(default)]
    pub on_screen_display: OsdConfig,
}

impl VideoConfig {
    fn default_media_player() -> String {
        "headless".to_string()
    }

    fn default_file_path() -> PathBuf {
        PathBuf::from("ride.mp4")
    }

    fn default_window_scale_factor() -> f64 {
        1.0
    }

    fn default_seek_to_position() -> String {
        "00:00".to_string()
    }

    fn default_update_interval_sec() -> f64 {
        0.25
    }

    fn default_speed_multiplier() -> f64 {
        1.0
    }

    /// Start position in seconds.
    pub fn seek_seconds(&self) -> Result<u64, ConfigError> {
        parse_seek_position(&self.seek_to_position)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.media_player.trim().is_empty() {
            return Err(ConfigError::invalid("video.media_player", "must not be empty"));
        }
        if self.file_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("video.file_path", "must not be empty"));
        }
        check_range(
            "video.window_scale_factor",
            self.window_scale_factor,
            0.1,
            1.0,
        )?;
        check_range(
            "video.update_interval_sec",
            self.update_interval_sec,
            0.1,
            3.0,
        )?;
        check_range("video.speed_multiplier", self.speed_multiplier, 0.1, 1.5)?;
        if !(10..=200).contains(&self.on_screen_display.font_size) {
            return Err(ConfigError::invalid(
                "video.on_screen_display.font_size",
                format!("{} is outside 10..=200", self.on_screen_display.font_size),
            ));
        }
        self.seek_seconds()?;
        Ok(())
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            media_player: Self::default_media_player(),
            file_path: Self::default_file_path(),
            window_scale_factor: Self::default_window_scale_factor(),
            seek_to_position: Self::default_seek_to_position(),
            update_interval_sec: Self::default_update_interval_sec(),
            speed_multiplier: Self::default_speed_multiplier(),
            on_screen_display: OsdConfig::default(),
        }
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{value} is outside {min}..={max}"),
        ))
    }
}

/// Parse "MM:SS" or "HH:MM:SS" into seconds.
///
/// Minutes and seconds must be below 60 when a larger field precedes them.
pub fn parse_seek_position(value: &str) -> Result<u64, ConfigError> {
    let invalid = || {
        ConfigError::invalid(
            "video.seek_to_position",
            format!("expected MM:SS or HH:MM:SS, got \"{value}\""),
        )
    };

    let fields = value
        .trim()
        .split(':')
        .map(|part| part.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;

    match fields.as_slice() {
        [minutes, seconds] if *seconds < 60 => Ok(minutes * 60 + seconds),
        [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => {
            Ok(hours * 3600 + minutes * 60 + seconds)
        }
        _ => Err(invalid()),
    }
}
