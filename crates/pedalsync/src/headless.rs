//! Player backend with no video output.
//!
//! Keeps a wall-clock model of playback (position, rate, pause) so the sync
//! loop, status polling, and end-of-stream handling behave as they would with
//! a real player. Useful for dry runs and for exercising a sensor setup.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::player::{OsdOptions, PlayerAdapter, PlayerEvent};

/// Media length assumed when the registry builds a headless player.
pub const DEFAULT_MEDIA_LENGTH: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Playback {
    file: Option<PathBuf>,
    position_secs: f64,
    rate: f64,
    paused: bool,
    last_advance: Instant,
    watching_events: bool,
    end_reported: bool,
    overlay: Option<String>,
    terminated: bool,
}

pub struct HeadlessPlayer {
    length: Duration,
    playback: Mutex<Playback>,
}

impl HeadlessPlayer {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            playback: Mutex::new(Playback {
                file: None,
                position_secs: 0.0,
                rate: 1.0,
                paused: true,
                last_advance: Instant::now(),
                watching_events: false,
                end_reported: false,
                overlay: None,
                terminated: false,
            }),
        }
    }

    /// Current playback position in seconds.
    pub fn position(&self) -> f64 {
        let mut playback = self.lock();
        self.advance(&mut playback);
        playback.position_secs
    }

    /// Last overlay text shown, if any.
    pub fn overlay(&self) -> Option<String> {
        self.lock().overlay.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, playback: &mut Playback) {
        let now = Instant::now();
        if !playback.paused && playback.file.is_some() {
            let elapsed = now.duration_since(playback.last_advance).as_secs_f64();
            playback.position_secs =
                (playback.position_secs + elapsed * playback.rate).min(self.length.as_secs_f64());
        }
        playback.last_advance = now;
    }

    /// Lock, advance the clock, and reject commands after termination.
    fn live(&self) -> Result<std::sync::MutexGuard<'_, Playback>> {
        let mut playback = self.lock();
        if playback.terminated {
            bail!("headless player has been terminated");
        }
        self.advance(&mut playback);
        Ok(playback)
    }
}

#[async_trait]
impl PlayerAdapter for HeadlessPlayer {
    async fn load_file(&self, path: &Path) -> Result<()> {
        let mut playback = self.live()?;
        playback.file = Some(path.to_path_buf());
        playback.position_secs = 0.0;
        playback.end_reported = false;
        info!(file = %path.display(), length_secs = self.length.as_secs(), "headless player loaded file");
        Ok(())
    }

    async fn set_speed(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate < 0.0 {
            bail!("invalid playback rate {rate}");
        }
        self.live()?.rate = rate;
        Ok(())
    }

    async fn set_pause(&self, paused: bool) -> Result<()> {
        self.live()?.paused = paused;
        Ok(())
    }

    async fn time_remaining(&self) -> Result<u64> {
        let playback = self.live()?;
        if playback.file.is_none() {
            bail!("no file loaded");
        }
        let remaining = self.length.as_secs_f64() - playback.position_secs;
        Ok(remaining.max(0.0).round() as u64)
    }

    async fn seek(&self, position: u64) -> Result<()> {
        let mut playback = self.live()?;
        playback.position_secs = (position as f64).min(self.length.as_secs_f64());
        debug!(position, "headless player seeked");
        Ok(())
    }

    async fn set_on_screen_display(&self, options: &OsdOptions) -> Result<()> {
        let _playback = self.live()?;
        debug!(?options, "headless player osd configured");
        Ok(())
    }

    async fn show_overlay_text(&self, text: &str) -> Result<()> {
        self.live()?.overlay = Some(text.to_string());
        Ok(())
    }

    async fn setup_event_watch(&self) -> Result<()> {
        self.live()?.watching_events = true;
        Ok(())
    }

    async fn poll_event(&self, timeout: Duration) -> PlayerEvent {
        if let Some(event) = self.take_event() {
            return event;
        }
        if timeout.is_zero() {
            return PlayerEvent::None;
        }
        tokio::time::sleep(timeout).await;
        self.take_event().unwrap_or(PlayerEvent::None)
    }

    fn terminate(&self) {
        let mut playback = self.lock();
        if !playback.terminated {
            playback.terminated = true;
            playback.paused = true;
            info!("headless player terminated");
        }
    }
}

impl HeadlessPlayer {
    fn take_event(&self) -> Option<PlayerEvent> {
        let mut playback = self.lock();
        if playback.terminated || !playback.watching_events || playback.end_reported {
            return None;
        }
        self.advance(&mut playback);
        if playback.file.is_some() && playback.position_secs >= self.length.as_secs_f64() {
            playback.end_reported = true;
            return Some(PlayerEvent::EndOfStream);
        }
        None
    }
}
