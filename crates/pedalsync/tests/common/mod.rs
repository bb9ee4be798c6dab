//! Scriptable collaborators shared by the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use pedalconf::SessionConfig;
use pedalsync::{
    DeviceHandle, OsdOptions, PlayerAdapter, PlayerEvent, ScanResult, SensorClient,
    SessionFactory, SessionState, SessionStateManager, SpeedSmoother, TaskError,
};
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Session file with fast timings and the given extra TOML appended.
pub fn session_file(extra: &str) -> NamedTempFile {
    session_file_with(
        "backend = \"mock\"\nscan_timeout_secs = 2",
        "media_player = \"mock\"",
        extra,
    )
}

/// Session file with the given keys inside the `[sensor]` and `[video]` tables.
pub fn session_file_with(sensor: &str, video: &str, extra: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[sensor]
{sensor}

[video]
file_path = "/videos/alpine-climb.mp4"
update_interval_sec = 0.1
{video}

[app]
shutdown_timeout_ms = 200

{extra}
"#
    )
    .unwrap();
    file
}

/// Wait until the manager publishes `want`.
pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
        .unwrap();
}

#[derive(Default)]
pub struct MockPlayer {
    pub loaded: Mutex<Option<String>>,
    pub rates: Mutex<Vec<f64>>,
    pub seeks: Mutex<Vec<u64>>,
    pub fail_load: AtomicBool,
    pub fail_set_speed: AtomicBool,
    pub end_of_stream: AtomicBool,
    pub terminated: AtomicUsize,
}

impl MockPlayer {
    pub fn terminate_count(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlayerAdapter for MockPlayer {
    async fn load_file(&self, path: &Path) -> Result<()> {
        if self.fail_load.load(Ordering::SeqCst) {
            bail!("codec not supported");
        }
        *self.loaded.lock().unwrap() = Some(path.display().to_string());
        Ok(())
    }

    async fn set_speed(&self, rate: f64) -> Result<()> {
        if self.fail_set_speed.load(Ordering::SeqCst) {
            bail!("player went away");
        }
        self.rates.lock().unwrap().push(rate);
        Ok(())
    }

    async fn set_pause(&self, _paused: bool) -> Result<()> {
        Ok(())
    }

    async fn time_remaining(&self) -> Result<u64> {
        Ok(1800)
    }

    async fn seek(&self, position: u64) -> Result<()> {
        self.seeks.lock().unwrap().push(position);
        Ok(())
    }

    async fn set_on_screen_display(&self, _options: &OsdOptions) -> Result<()> {
        Ok(())
    }

    async fn show_overlay_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn setup_event_watch(&self) -> Result<()> {
        Ok(())
    }

    async fn poll_event(&self, _timeout: Duration) -> PlayerEvent {
        if self.end_of_stream.swap(false, Ordering::SeqCst) {
            PlayerEvent::EndOfStream
        } else {
            PlayerEvent::None
        }
    }

    fn terminate(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

/// Where the mock sensor's connect sequence fails, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Nowhere,
    Scan,
    Connect,
    Battery,
    SpeedServices,
}

pub struct MockSensor {
    pub fail_at: FailAt,
    /// Scan never finds anything; it waits for cancellation.
    pub scan_hangs: bool,
    pub speed: f64,
    /// `run_updates` fails this long after starting.
    pub fail_updates_after: Option<Duration>,
    pub stop_scan_calls: AtomicUsize,
    pub updates_started: AtomicBool,
}

impl MockSensor {
    pub fn new(speed: f64) -> Self {
        Self {
            fail_at: FailAt::Nowhere,
            scan_hangs: false,
            speed,
            fail_updates_after: None,
            stop_scan_calls: AtomicUsize::new(0),
            updates_started: AtomicBool::new(false),
        }
    }

    fn check(&self, stage: FailAt) -> Result<()> {
        if self.fail_at == stage {
            return Err(anyhow!("{stage:?} failed"));
        }
        Ok(())
    }
}

#[async_trait]
impl SensorClient for MockSensor {
    async fn scan(&self, cancel: &CancellationToken) -> Result<ScanResult> {
        if self.scan_hangs {
            cancel.cancelled().await;
            bail!("scan cancelled");
        }
        self.check(FailAt::Scan)?;
        Ok(ScanResult {
            address: "C0:FF:EE:00:00:01".to_string(),
            name: "Mock CSC".to_string(),
        })
    }

    async fn connect(&self, _cancel: &CancellationToken, found: &ScanResult) -> Result<DeviceHandle> {
        self.check(FailAt::Connect)?;
        Ok(DeviceHandle {
            address: found.address.clone(),
            name: found.name.clone(),
        })
    }

    async fn discover_battery_service(&self, _device: &DeviceHandle) -> Result<()> {
        self.check(FailAt::Battery)
    }

    async fn discover_battery_level(&self, _device: &DeviceHandle) -> Result<u8> {
        Ok(64)
    }

    async fn discover_speed_services(&self, _device: &DeviceHandle) -> Result<()> {
        self.check(FailAt::SpeedServices)
    }

    async fn discover_speed_characteristics(&self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    async fn run_updates(
        &self,
        cancel: CancellationToken,
        smoother: Arc<dyn SpeedSmoother>,
    ) -> Result<(), TaskError> {
        self.updates_started.store(true, Ordering::SeqCst);
        smoother.record(self.speed);

        match self.fail_updates_after {
            Some(delay) => tokio::select! {
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                _ = tokio::time::sleep(delay) => Err(anyhow!("sensor disconnected").into()),
            },
            None => {
                cancel.cancelled().await;
                Err(TaskError::Cancelled)
            }
        }
    }

    fn stop_scan(&self) {
        self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn battery_level(&self) -> Option<u8> {
        (self.fail_at != FailAt::Battery).then_some(64)
    }
}

/// Hands out the same mock player and sensor to every session.
pub struct MockFactory {
    pub player: Arc<MockPlayer>,
    pub sensor: Arc<MockSensor>,
}

impl MockFactory {
    pub fn new(player: MockPlayer, sensor: MockSensor) -> Arc<Self> {
        Arc::new(Self {
            player: Arc::new(player),
            sensor: Arc::new(sensor),
        })
    }
}

impl SessionFactory for MockFactory {
    fn player(&self, _config: &SessionConfig) -> Result<Arc<dyn PlayerAdapter>> {
        Ok(self.player.clone())
    }

    fn sensor(&self, _config: &SessionConfig) -> Result<Arc<dyn SensorClient>> {
        Ok(self.sensor.clone())
    }
}

pub fn manager(factory: &Arc<MockFactory>) -> SessionStateManager {
    SessionStateManager::new(factory.clone())
}
