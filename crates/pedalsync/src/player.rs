//! Media player contract.
//!
//! The session core drives playback only through [`PlayerAdapter`]. Concrete
//! backends register themselves with a [`BackendRegistry`](crate::BackendRegistry)
//! and are never inspected beyond this trait.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pedalconf::OsdConfig;

/// Events a player can report between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    None,
    EndOfStream,
}

/// Styling for the on-screen text overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdOptions {
    pub font_size: u32,
    pub margin_x: u32,
    pub margin_y: u32,
    /// When false the backend should suppress its own status overlays as well.
    pub enabled: bool,
}

impl From<&OsdConfig> for OsdOptions {
    fn from(config: &OsdConfig) -> Self {
        Self {
            font_size: config.font_size,
            margin_x: config.margin_x,
            margin_y: config.margin_y,
            enabled: config.enabled(),
        }
    }
}

/// Capability set every media backend implements.
#[async_trait]
pub trait PlayerAdapter: Send + Sync {
    async fn load_file(&self, path: &Path) -> Result<()>;

    /// Set the playback rate, 1.0 being normal speed.
    async fn set_speed(&self, rate: f64) -> Result<()>;

    async fn set_pause(&self, paused: bool) -> Result<()>;

    /// Seconds of media left to play.
    async fn time_remaining(&self) -> Result<u64>;

    /// Jump to `position` seconds from the start.
    async fn seek(&self, position: u64) -> Result<()>;

    async fn set_on_screen_display(&self, options: &OsdOptions) -> Result<()>;

    async fn show_overlay_text(&self, text: &str) -> Result<()>;

    /// Subscribe to the events reported by [`poll_event`](Self::poll_event).
    async fn setup_event_watch(&self) -> Result<()>;

    /// Wait at most `timeout` for the next event. A zero timeout only checks.
    async fn poll_event(&self, timeout: Duration) -> PlayerEvent;

    /// Release the backend. Must be safe to call more than once.
    fn terminate(&self);
}
