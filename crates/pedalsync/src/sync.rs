//! Playback speed synchronization.
//!
//! [`SyncLoop`] runs once per session. On every tick of a fixed interval it
//! reads the smoothed sensor speed and decides whether the player needs a new
//! rate. Small changes inside the hysteresis band are ignored so sensor noise
//! does not show up as visible speed jitter. A reading of exactly zero pauses
//! playback.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use pedalconf::{OsdConfig, SessionConfig, SpeedUnits};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::player::{PlayerAdapter, PlayerEvent};
use crate::sensor::SpeedSmoother;

/// Sensor speed that maps to 1.0x playback before the configured multiplier.
pub const SPEED_DIVISOR: f64 = 10.0;

/// Overlay shown while playback is paused for zero speed.
pub const PAUSED_OVERLAY: &str = "Paused";

/// Placeholder for an unknown time remaining.
pub const UNKNOWN_TIME: &str = "--:--:--";

const EVENT_POLL_TIMEOUT: Duration = Duration::ZERO;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("player {action} failed: {source:#}")]
    Player {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

fn player_error(action: &'static str) -> impl FnOnce(anyhow::Error) -> SyncError {
    move |source| SyncError::Player { action, source }
}

/// Why a [`SyncLoop`] stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    Cancelled,
    PlaybackComplete,
}

/// Settings fixed for the lifetime of one loop.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub update_interval: Duration,
    pub speed_threshold: f64,
    /// Precomputed `speed_multiplier / (unit conversion factor * SPEED_DIVISOR)`.
    pub speed_unit_multiplier: f64,
    pub speed_units: SpeedUnits,
    pub osd: OsdConfig,
}

impl SyncSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        let units = config.speed.speed_units;
        Self {
            update_interval: Duration::from_secs_f64(config.video.update_interval_sec),
            speed_threshold: config.speed.speed_threshold,
            speed_unit_multiplier: config.video.speed_multiplier
                / (units.conversion_factor() * SPEED_DIVISOR),
            speed_units: units,
            osd: config.video.on_screen_display.clone(),
        }
    }
}

/// Smoothed speed now and at the last rate change.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackSpeedState {
    pub current: f64,
    pub last: f64,
}

/// What the loop last told the player, for status polling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub rate: f64,
    pub time_remaining: Option<u64>,
    pub paused: bool,
}

/// Shared between the loop (writer) and the session status accessors (readers).
#[derive(Debug, Default)]
pub struct PlaybackTelemetry(RwLock<PlaybackSnapshot>);

impl PlaybackTelemetry {
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut PlaybackSnapshot)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Format seconds as `HH:MM:SS`. Hours are not wrapped.
pub fn format_seconds(total: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

pub struct SyncLoop {
    player: Arc<dyn PlayerAdapter>,
    smoother: Arc<dyn SpeedSmoother>,
    settings: SyncSettings,
    speed: PlaybackSpeedState,
    telemetry: Arc<PlaybackTelemetry>,
}

impl SyncLoop {
    pub fn new(
        player: Arc<dyn PlayerAdapter>,
        smoother: Arc<dyn SpeedSmoother>,
        settings: SyncSettings,
        telemetry: Arc<PlaybackTelemetry>,
    ) -> Self {
        Self {
            player,
            smoother,
            settings,
            speed: PlaybackSpeedState::default(),
            telemetry,
        }
    }

    pub fn speed_state(&self) -> PlaybackSpeedState {
        self.speed
    }

    /// Run until cancelled or the player reports end of stream.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SyncExit, SyncError> {
        let mut ticker = tokio::time::interval(self.settings.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval = ?self.settings.update_interval,
            threshold = self.settings.speed_threshold,
            multiplier = self.settings.speed_unit_multiplier,
            "playback sync started"
        );

        loop {
            // End of stream takes priority over a pending tick
            if self.player.poll_event(EVENT_POLL_TIMEOUT).await == PlayerEvent::EndOfStream {
                info!("playback complete");
                return Ok(SyncExit::PlaybackComplete);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("playback sync cancelled");
                    return Ok(SyncExit::Cancelled);
                }
                _ = ticker.tick() => self.tick().await?,
            }
        }
    }

    /// One control step: read speed, then pause, skip, or push a new rate.
    pub async fn tick(&mut self) -> Result<(), SyncError> {
        self.speed.current = self.smoother.smoothed_speed();

        if self.speed.current == 0.0 {
            return self.pause().await;
        }

        if !self.should_update() {
            trace!(
                current = self.speed.current,
                last = self.speed.last,
                "speed change inside threshold"
            );
            return Ok(());
        }

        self.apply_rate().await
    }

    fn should_update(&self) -> bool {
        self.settings.osd.display_time_remaining
            || (self.speed.current - self.speed.last).abs() > self.settings.speed_threshold
    }

    async fn pause(&mut self) -> Result<(), SyncError> {
        self.player
            .set_pause(true)
            .await
            .map_err(player_error("pause"))?;

        if self.settings.osd.enabled() {
            self.player
                .show_overlay_text(PAUSED_OVERLAY)
                .await
                .map_err(player_error("overlay"))?;
        }

        self.telemetry.update(|snapshot| snapshot.paused = true);
        debug!("no speed, playback paused");
        Ok(())
    }

    async fn apply_rate(&mut self) -> Result<(), SyncError> {
        let rate = self.speed.current * self.settings.speed_unit_multiplier;

        self.player
            .set_speed(rate)
            .await
            .map_err(player_error("set speed"))?;
        self.player
            .set_pause(false)
            .await
            .map_err(player_error("resume"))?;

        let remaining = match self.player.time_remaining().await {
            Ok(seconds) => Some(seconds),
            Err(e) => {
                debug!("time remaining unavailable: {:#}", e);
                None
            }
        };

        if self.settings.osd.enabled() {
            let text = self.overlay_text(rate, remaining);
            self.player
                .show_overlay_text(&text)
                .await
                .map_err(player_error("overlay"))?;
        }

        self.telemetry.update(|snapshot| {
            snapshot.rate = rate;
            snapshot.time_remaining = remaining;
            snapshot.paused = false;
        });

        debug!(speed = self.speed.current, rate, "playback rate updated");
        self.speed.last = self.speed.current;
        Ok(())
    }

    fn overlay_text(&self, rate: f64, remaining: Option<u64>) -> String {
        let osd = &self.settings.osd;
        let mut lines = Vec::with_capacity(3);

        if osd.display_cycle_speed {
            lines.push(format!(
                "Cycle Speed: {:.1} {}",
                self.speed.current,
                self.settings.speed_units.label()
            ));
        }
        if osd.display_playback_speed {
            lines.push(format!("Playback Speed: {rate:.2}x"));
        }
        if osd.display_time_remaining {
            let remaining = remaining
                .map(format_seconds)
                .unwrap_or_else(|| UNKNOWN_TIME.to_string());
            lines.push(format!("Time Remaining: {remaining}"));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::player::OsdOptions;

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        SetSpeed(f64),
        SetPause(bool),
        Overlay(String),
    }

    #[derive(Default)]
    struct RecordingPlayer {
        commands: Mutex<Vec<Command>>,
        end_of_stream: Mutex<bool>,
        fail_speed: bool,
    }

    impl RecordingPlayer {
        fn commands(&self) -> Vec<Command> {
            self.commands.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.commands.lock().unwrap().clear();
        }

        fn speed_commands(&self) -> Vec<f64> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    Command::SetSpeed(rate) => Some(rate),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PlayerAdapter for RecordingPlayer {
        async fn load_file(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn set_speed(&self, rate: f64) -> Result<()> {
            if self.fail_speed {
                anyhow::bail!("socket closed");
            }
            self.commands.lock().unwrap().push(Command::SetSpeed(rate));
            Ok(())
        }

        async fn set_pause(&self, paused: bool) -> Result<()> {
            self.commands.lock().unwrap().push(Command::SetPause(paused));
            Ok(())
        }

        async fn time_remaining(&self) -> Result<u64> {
            Ok(3661)
        }

        async fn seek(&self, _position: u64) -> Result<()> {
            Ok(())
        }

        async fn set_on_screen_display(&self, _options: &OsdOptions) -> Result<()> {
            Ok(())
        }

        async fn show_overlay_text(&self, text: &str) -> Result<()> {
            self.commands
                .lock()
                .unwrap()
                .push(Command::Overlay(text.to_string()));
            Ok(())
        }

        async fn setup_event_watch(&self) -> Result<()> {
            Ok(())
        }

        async fn poll_event(&self, _timeout: Duration) -> PlayerEvent {
            if *self.end_of_stream.lock().unwrap() {
                PlayerEvent::EndOfStream
            } else {
                PlayerEvent::None
            }
        }

        fn terminate(&self) {}
    }

    struct FixedSmoother(Mutex<f64>);

    impl FixedSmoother {
        fn set(&self, speed: f64) {
            *self.0.lock().unwrap() = speed;
        }
    }

    impl SpeedSmoother for FixedSmoother {
        fn record(&self, speed: f64) {
            self.set(speed);
        }

        fn smoothed_speed(&self) -> f64 {
            *self.0.lock().unwrap()
        }

        fn reset(&self) {
            self.set(0.0);
        }
    }

    fn settings(threshold: f64, osd: OsdConfig) -> SyncSettings {
        let mut config = SessionConfig::default();
        config.speed.speed_threshold = threshold;
        config.video.on_screen_display = osd;
        SyncSettings::from_config(&config)
    }

    fn make_loop(
        settings: SyncSettings,
    ) -> (SyncLoop, Arc<RecordingPlayer>, Arc<FixedSmoother>) {
        let player = Arc::new(RecordingPlayer::default());
        let smoother = Arc::new(FixedSmoother(Mutex::new(0.0)));
        let sync = SyncLoop::new(
            player.clone(),
            smoother.clone(),
            settings,
            Arc::new(PlaybackTelemetry::default()),
        );
        (sync, player, smoother)
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(3661), "01:01:01");
        assert_eq!(format_seconds(0), "00:00:00");
        assert_eq!(format_seconds(86399), "23:59:59");
        assert_eq!(format_seconds(360000), "100:00:00");
    }

    #[test]
    fn test_speed_unit_multiplier() {
        let mut config = SessionConfig::default();
        config.video.speed_multiplier = 0.8;
        let kmh = SyncSettings::from_config(&config);
        assert!((kmh.speed_unit_multiplier - 0.08).abs() < 1e-12);

        config.speed.speed_units = SpeedUnits::Mph;
        let mph = SyncSettings::from_config(&config);
        assert!((mph.speed_unit_multiplier - 0.8 / (0.621371 * 10.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_hysteresis_gate() {
        let (mut sync, player, smoother) = make_loop(settings(0.2, OsdConfig::default()));
        sync.speed.last = 10.0;

        smoother.set(10.1);
        sync.tick().await.unwrap();
        assert!(player.speed_commands().is_empty());
        assert_eq!(sync.speed_state().last, 10.0);

        smoother.set(10.3);
        sync.tick().await.unwrap();
        let speeds = player.speed_commands();
        assert_eq!(speeds.len(), 1);
        let expected = 10.3 * sync.settings.speed_unit_multiplier;
        assert!((speeds[0] - expected).abs() < 1e-12);
        assert_eq!(sync.speed_state().last, 10.3);
    }

    #[tokio::test]
    async fn test_update_resumes_playback() {
        let (mut sync, player, smoother) = make_loop(settings(0.2, OsdConfig::default()));
        smoother.set(20.0);
        sync.tick().await.unwrap();

        assert_eq!(
            player.commands(),
            vec![Command::SetSpeed(2.0), Command::SetPause(false)]
        );
        let snapshot = sync.telemetry.snapshot();
        assert_eq!(snapshot.rate, 2.0);
        assert_eq!(snapshot.time_remaining, Some(3661));
        assert!(!snapshot.paused);
    }

    #[tokio::test]
    async fn test_time_remaining_display_bypasses_threshold() {
        let osd = OsdConfig {
            display_time_remaining: true,
            ..OsdConfig::default()
        };
        let (mut sync, player, smoother) = make_loop(settings(5.0, osd));
        sync.speed.last = 10.0;
        smoother.set(10.0);

        sync.tick().await.unwrap();
        sync.tick().await.unwrap();

        assert_eq!(player.speed_commands().len(), 2);
        assert!(player
            .commands()
            .contains(&Command::Overlay("Time Remaining: 01:01:01".to_string())));
    }

    #[tokio::test]
    async fn test_zero_speed_pauses() {
        let osd = OsdConfig {
            display_cycle_speed: true,
            ..OsdConfig::default()
        };
        let (mut sync, player, smoother) = make_loop(settings(0.2, osd));

        smoother.set(12.0);
        sync.tick().await.unwrap();
        player.clear();

        smoother.set(0.0);
        sync.tick().await.unwrap();

        assert_eq!(
            player.commands(),
            vec![
                Command::SetPause(true),
                Command::Overlay(PAUSED_OVERLAY.to_string())
            ]
        );
        // Last stays at the speed of the last rate change
        assert_eq!(sync.speed_state().last, 12.0);
        assert!(sync.telemetry.snapshot().paused);
    }

    #[tokio::test]
    async fn test_zero_speed_without_osd_skips_overlay() {
        let (mut sync, player, _smoother) = make_loop(settings(0.2, OsdConfig::default()));
        sync.tick().await.unwrap();
        assert_eq!(player.commands(), vec![Command::SetPause(true)]);
    }

    #[tokio::test]
    async fn test_overlay_text_lines() {
        let osd = OsdConfig {
            display_cycle_speed: true,
            display_playback_speed: true,
            display_time_remaining: true,
            ..OsdConfig::default()
        };
        let (mut sync, player, smoother) = make_loop(settings(0.2, osd));
        smoother.set(15.0);
        sync.tick().await.unwrap();

        let expected = "Cycle Speed: 15.0 km/h\nPlayback Speed: 1.50x\nTime Remaining: 01:01:01";
        assert!(player
            .commands()
            .contains(&Command::Overlay(expected.to_string())));
    }

    #[tokio::test]
    async fn test_player_failure_is_an_error() {
        let player = Arc::new(RecordingPlayer {
            fail_speed: true,
            ..RecordingPlayer::default()
        });
        let smoother = Arc::new(FixedSmoother(Mutex::new(18.0)));
        let mut sync = SyncLoop::new(
            player,
            smoother,
            settings(0.2, OsdConfig::default()),
            Arc::new(PlaybackTelemetry::default()),
        );

        let err = sync.tick().await.unwrap_err();
        assert!(err.to_string().contains("set speed"));
        assert!(err.to_string().contains("socket closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (sync, _player, smoother) = make_loop(settings(0.2, OsdConfig::default()));
        smoother.set(10.0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sync.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap().unwrap(), SyncExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_playback_complete() {
        let (sync, player, _smoother) = make_loop(settings(0.2, OsdConfig::default()));
        *player.end_of_stream.lock().unwrap() = true;

        let exit = sync.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, SyncExit::PlaybackComplete);
        assert!(player.commands().is_empty());
    }
}
