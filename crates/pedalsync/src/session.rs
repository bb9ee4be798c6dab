//! Session lifecycle.
//!
//! [`SessionStateManager`] owns the configuration snapshots, the state machine,
//! and the live collaborators of at most one running session:
//!
//! ```text
//! Idle --load ok--> Loaded --start--> Connecting --connected--> Connected --> Running
//! Connecting/Connected --connect failed--> Loaded
//! Running --task failed--> Error
//! Running --playback complete / signal--> Loaded
//! any active state --stop--> Loaded
//! ```
//!
//! All fields sit behind one lock. Long operations (building the player,
//! the sensor connect sequence, teardown) run outside it and commit their
//! results under a fresh write lock, after checking that the session they
//! started for is still the current one.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{bail, Context};
use pedalconf::{ConfigError, SessionConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::SessionFactory;
use crate::error::{SessionError, TaskError};
use crate::lifecycle::ShutdownCoordinator;
use crate::player::{OsdOptions, PlayerAdapter};
use crate::sensor::{DeviceHandle, RadioLock, SensorClient, SpeedSmoother};
use crate::sync::{format_seconds, PlaybackTelemetry, SyncExit, SyncLoop, SyncSettings, UNKNOWN_TIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Loaded,
    Connecting,
    Connected,
    Running,
    Paused,
    Error,
}

impl SessionState {
    /// States in which a session owns live collaborators or is acquiring them.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::Running
                | SessionState::Paused
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loaded => "loaded",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parses and validates session files.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<SessionConfig, ConfigError>;
}

/// Loads session files from disk with [`SessionConfig::load_from`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigLoader;

impl ConfigLoader for FileConfigLoader {
    fn load(&self, path: &Path) -> Result<SessionConfig, ConfigError> {
        SessionConfig::load_from(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Overrides `app.shutdown_timeout_ms` from the session config.
    pub shutdown_timeout: Option<Duration>,
    /// Tear the running session down on SIGINT/SIGTERM.
    pub handle_signals: bool,
    /// Shared with every sensor client this manager creates.
    pub radio: RadioLock,
}

/// Point-in-time view for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub battery_level: u8,
    pub current_speed: f64,
    pub playback_rate: f64,
    pub time_remaining: String,
    pub error_message: String,
}

/// Live collaborators of the running session.
struct TaskBundle {
    sensor: Arc<dyn SensorClient>,
    smoother: Arc<dyn SpeedSmoother>,
    player: Arc<dyn PlayerAdapter>,
    device: DeviceHandle,
    telemetry: Arc<PlaybackTelemetry>,
}

/// Collaborators built before the sensor is connected.
struct SessionParts {
    sensor: Arc<dyn SensorClient>,
    smoother: Arc<dyn SpeedSmoother>,
    player: Arc<dyn PlayerAdapter>,
}

/// The two long-lived tasks of a committed session.
struct SessionTasks {
    sensor: Arc<dyn SensorClient>,
    smoother: Arc<dyn SpeedSmoother>,
    sync_loop: SyncLoop,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    edit_config: Option<Arc<SessionConfig>>,
    active_config: Option<Arc<SessionConfig>>,
    bundle: Option<TaskBundle>,
    coordinator: Option<Arc<ShutdownCoordinator>>,
    /// Start attempt currently between prepare and commit.
    pending_start: Option<u64>,
    next_attempt: u64,
    error_message: String,
}

impl Inner {
    fn owns(&self, coordinator: &Arc<ShutdownCoordinator>) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, coordinator))
    }

    /// Detach everything tied to the current session.
    fn release(&mut self) -> (Option<Arc<ShutdownCoordinator>>, Option<TaskBundle>) {
        self.pending_start = None;
        self.active_config = None;
        (self.coordinator.take(), self.bundle.take())
    }
}

struct Shared {
    inner: RwLock<Inner>,
    state_tx: watch::Sender<SessionState>,
    loader: Arc<dyn ConfigLoader>,
    factory: Arc<dyn SessionFactory>,
    options: ManagerOptions,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change state and publish it. Callers hold the write lock.
    fn transition(&self, inner: &mut Inner, to: SessionState) {
        if inner.state != to {
            debug!(from = %inner.state, to = %to, "session state change");
            inner.state = to;
        }
        self.state_tx.send_replace(to);
    }
}

/// Owns the lifecycle of at most one cycling session. Cheap to clone.
#[derive(Clone)]
pub struct SessionStateManager {
    shared: Arc<Shared>,
}

impl SessionStateManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_options(
            Arc::new(FileConfigLoader),
            factory,
            ManagerOptions::default(),
        )
    }

    pub fn with_options(
        loader: Arc<dyn ConfigLoader>,
        factory: Arc<dyn SessionFactory>,
        options: ManagerOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner::default()),
                state_tx,
                loader,
                factory,
                options,
            }),
        }
    }

    // === Lifecycle ===

    /// Parse and validate a session file, replacing the edit config.
    ///
    /// A failure moves the manager to `Error` unless a session is active, in
    /// which case the running session is left alone.
    pub fn load_session(&self, path: &Path) -> Result<(), SessionError> {
        let result = self.shared.loader.load(path);
        let mut inner = self.shared.write();

        match result {
            Ok(config) => {
                inner.edit_config = Some(Arc::new(config));
                if matches!(inner.state, SessionState::Idle | SessionState::Error) {
                    inner.error_message.clear();
                    self.shared.transition(&mut inner, SessionState::Loaded);
                }
                info!(path = %path.display(), state = %inner.state, "session config loaded");
                Ok(())
            }
            Err(e) => {
                if inner.state.is_active() {
                    warn!(path = %path.display(), "failed to load config, keeping running session: {}", e);
                } else {
                    inner.error_message = e.to_string();
                    self.shared.transition(&mut inner, SessionState::Error);
                    warn!(path = %path.display(), "failed to load config: {}", e);
                }
                Err(e.into())
            }
        }
    }

    /// Build collaborators, connect the sensor, and run the session tasks.
    ///
    /// Any failure before the session is running rolls back to `Loaded` and
    /// tears down whatever was built.
    pub async fn start_session(&self) -> Result<(), SessionError> {
        let (attempt, config) = self.prepare_start()?;

        let timeout = self
            .shared
            .options
            .shutdown_timeout
            .unwrap_or_else(|| Duration::from_millis(config.app.shutdown_timeout_ms));
        let coordinator = Arc::new(ShutdownCoordinator::new(timeout));

        // Published before connecting so a concurrent stop can cancel the scan
        if !self.attach_coordinator(attempt, &coordinator) {
            coordinator.shutdown().await;
            return Err(SessionError::StartAborted);
        }

        let bundle = match self.build_and_connect(&config, &coordinator).await {
            Ok(bundle) => bundle,
            Err(e) => {
                let owned = self.rollback(&coordinator).await;
                warn!("session start failed: {}", e);
                return Err(if owned { e } else { SessionError::StartAborted });
            }
        };

        let tasks = SessionTasks {
            sensor: Arc::clone(&bundle.sensor),
            smoother: Arc::clone(&bundle.smoother),
            sync_loop: SyncLoop::new(
                Arc::clone(&bundle.player),
                Arc::clone(&bundle.smoother),
                SyncSettings::from_config(&config),
                Arc::clone(&bundle.telemetry),
            ),
        };
        let device = bundle.device.clone();

        if !self.commit(&coordinator, bundle) {
            coordinator.shutdown().await;
            return Err(SessionError::StartAborted);
        }
        self.launch(&coordinator, tasks)?;

        info!(device = %device.name, address = %device.address, "session running");
        Ok(())
    }

    /// Cancel the current session (or a start in progress) and tear it down.
    pub async fn stop_session(&self) -> Result<(), SessionError> {
        let (coordinator, bundle) = {
            let mut inner = self.shared.write();
            let nothing_active = inner.coordinator.is_none()
                && inner.bundle.is_none()
                && inner.pending_start.is_none();
            if nothing_active {
                if inner.state == SessionState::Error {
                    inner.error_message.clear();
                    self.shared.transition(&mut inner, SessionState::Loaded);
                }
                return Err(SessionError::NoActiveSession);
            }
            let released = inner.release();
            self.shared.transition(&mut inner, SessionState::Loaded);
            released
        };

        info!("stopping session");
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        drop(bundle);
        Ok(())
    }

    /// Record an error, tearing down any active session.
    pub async fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let (coordinator, bundle) = {
            let mut inner = self.shared.write();
            let released = inner.release();
            inner.error_message = message.clone();
            self.shared.transition(&mut inner, SessionState::Error);
            released
        };

        warn!("session error: {}", message);
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        drop(bundle);
    }

    /// Tear down any session and forget the loaded config.
    pub async fn reset(&self) {
        let (coordinator, bundle) = {
            let mut inner = self.shared.write();
            let released = inner.release();
            inner.edit_config = None;
            inner.error_message.clear();
            self.shared.transition(&mut inner, SessionState::Idle);
            released
        };

        info!("session manager reset");
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        drop(bundle);
    }

    // === Accessors ===

    pub fn session_state(&self) -> SessionState {
        self.shared.read().state
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// The config under edit, replaced by each successful load.
    pub fn config(&self) -> Option<Arc<SessionConfig>> {
        self.shared.read().edit_config.clone()
    }

    /// The snapshot the active session was started with.
    pub fn active_config(&self) -> Option<Arc<SessionConfig>> {
        self.shared.read().active_config.clone()
    }

    /// Config of whatever is actually running, else the config under edit.
    pub fn effective_config(&self) -> Option<Arc<SessionConfig>> {
        let inner = self.shared.read();
        inner
            .active_config
            .clone()
            .or_else(|| inner.edit_config.clone())
    }

    pub fn error_message(&self) -> String {
        self.shared.read().error_message.clone()
    }

    /// True while the session owns live collaborators.
    pub fn has_active_tasks(&self) -> bool {
        self.shared.read().bundle.is_some()
    }

    pub fn connected_device(&self) -> Option<DeviceHandle> {
        self.shared.read().bundle.as_ref().map(|b| b.device.clone())
    }

    /// Sensor battery in percent, 0 when unknown.
    pub fn battery_level(&self) -> u8 {
        self.shared
            .read()
            .bundle
            .as_ref()
            .and_then(|b| b.sensor.battery_level())
            .unwrap_or(0)
    }

    pub fn current_speed(&self) -> f64 {
        self.shared
            .read()
            .bundle
            .as_ref()
            .map(|b| b.smoother.smoothed_speed())
            .unwrap_or(0.0)
    }

    /// `HH:MM:SS`, or `--:--:--` when unknown.
    pub fn playback_time_remaining(&self) -> String {
        self.shared
            .read()
            .bundle
            .as_ref()
            .and_then(|b| b.telemetry.snapshot().time_remaining)
            .map(format_seconds)
            .unwrap_or_else(|| UNKNOWN_TIME.to_string())
    }

    pub fn playback_rate(&self) -> f64 {
        self.shared
            .read()
            .bundle
            .as_ref()
            .map(|b| b.telemetry.snapshot().rate)
            .unwrap_or(0.0)
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.shared.read();
        let bundle = inner.bundle.as_ref();
        let playback = bundle.map(|b| b.telemetry.snapshot()).unwrap_or_default();

        SessionStatus {
            state: inner.state,
            battery_level: bundle.and_then(|b| b.sensor.battery_level()).unwrap_or(0),
            current_speed: bundle.map(|b| b.smoother.smoothed_speed()).unwrap_or(0.0),
            playback_rate: playback.rate,
            time_remaining: playback
                .time_remaining
                .map(format_seconds)
                .unwrap_or_else(|| UNKNOWN_TIME.to_string()),
            error_message: inner.error_message.clone(),
        }
    }

    // === Start phases ===

    fn prepare_start(&self) -> Result<(u64, Arc<SessionConfig>), SessionError> {
        let mut inner = self.shared.write();

        let config = inner
            .edit_config
            .clone()
            .ok_or(SessionError::NoSessionLoaded)?;

        if inner.state == SessionState::Error {
            inner.error_message.clear();
            self.shared.transition(&mut inner, SessionState::Loaded);
        }
        if inner.state != SessionState::Loaded {
            return Err(SessionError::InvalidState(inner.state));
        }
        if inner.bundle.is_some() || inner.pending_start.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        let attempt = inner.next_attempt;
        inner.next_attempt += 1;
        inner.pending_start = Some(attempt);
        inner.active_config = Some(Arc::clone(&config));
        self.shared.transition(&mut inner, SessionState::Connecting);

        Ok((attempt, config))
    }

    fn attach_coordinator(&self, attempt: u64, coordinator: &Arc<ShutdownCoordinator>) -> bool {
        let mut inner = self.shared.write();
        if inner.pending_start != Some(attempt) {
            debug!(attempt, "start superseded before connecting");
            return false;
        }
        inner.coordinator = Some(Arc::clone(coordinator));
        true
    }

    async fn build_and_connect(
        &self,
        config: &SessionConfig,
        coordinator: &Arc<ShutdownCoordinator>,
    ) -> Result<TaskBundle, SessionError> {
        let parts = self
            .build_parts(config, coordinator)
            .await
            .map_err(SessionError::Build)?;

        let device = connect_sensor(config, parts.sensor.as_ref(), &coordinator.token())
            .await
            .map_err(SessionError::Connect)?;

        if !self.advance_if_owner(coordinator, SessionState::Connected) {
            return Err(SessionError::StartAborted);
        }

        Ok(TaskBundle {
            sensor: parts.sensor,
            smoother: parts.smoother,
            player: parts.player,
            device,
            telemetry: Arc::new(PlaybackTelemetry::default()),
        })
    }

    async fn build_parts(
        &self,
        config: &SessionConfig,
        coordinator: &ShutdownCoordinator,
    ) -> anyhow::Result<SessionParts> {
        let factory = &self.shared.factory;
        let smoother = factory.smoother(config);

        let player = factory
            .player(config)
            .context("creating media player")?;
        {
            let player = Arc::clone(&player);
            coordinator.add_cleanup("media player", move || player.terminate());
        }

        let video = &config.video;
        player
            .load_file(&video.file_path)
            .await
            .with_context(|| format!("loading {}", video.file_path.display()))?;
        player
            .set_on_screen_display(&OsdOptions::from(&video.on_screen_display))
            .await
            .context("configuring on-screen display")?;
        let seek = video.seek_seconds()?;
        if seek > 0 {
            player
                .seek(seek)
                .await
                .context("seeking to start position")?;
        }
        player
            .setup_event_watch()
            .await
            .context("watching player events")?;

        let sensor = factory
            .sensor(config)
            .context("creating sensor client")?;
        {
            let sensor = Arc::clone(&sensor);
            let radio = self.shared.options.radio.clone();
            coordinator.add_cleanup("sensor scan", move || {
                let _radio = radio.hold();
                sensor.stop_scan();
            });
        }

        Ok(SessionParts {
            sensor,
            smoother,
            player,
        })
    }

    fn advance_if_owner(&self, coordinator: &Arc<ShutdownCoordinator>, to: SessionState) -> bool {
        let mut inner = self.shared.write();
        if !inner.owns(coordinator) || inner.pending_start.is_none() {
            return false;
        }
        self.shared.transition(&mut inner, to);
        true
    }

    fn commit(&self, coordinator: &Arc<ShutdownCoordinator>, bundle: TaskBundle) -> bool {
        let mut inner = self.shared.write();
        if !inner.owns(coordinator) || inner.pending_start.is_none() {
            debug!("start superseded before commit");
            return false;
        }
        inner.bundle = Some(bundle);
        inner.pending_start = None;
        self.shared.transition(&mut inner, SessionState::Running);
        true
    }

    /// Hand the session tasks to the coordinator. A stop that landed after
    /// commit has already torn the coordinator down; nothing is spawned then.
    fn launch(
        &self,
        coordinator: &Arc<ShutdownCoordinator>,
        tasks: SessionTasks,
    ) -> Result<(), SessionError> {
        if coordinator.is_cancelled() {
            debug!("session stopped before its tasks were launched");
            return Err(SessionError::StartAborted);
        }

        let SessionTasks {
            sensor,
            smoother,
            sync_loop,
        } = tasks;

        coordinator.run("sensor updates", move |token| async move {
            sensor.run_updates(token, smoother).await
        });
        coordinator.run("playback sync", move |token| async move {
            match sync_loop.run(token.clone()).await {
                Ok(SyncExit::PlaybackComplete) => {
                    // Ends the session without recording a failure
                    token.cancel();
                    Ok(())
                }
                Ok(SyncExit::Cancelled) => Err(TaskError::Cancelled),
                Err(e) => Err(TaskError::Failed(e.into())),
            }
        });

        if self.shared.options.handle_signals {
            coordinator.start();
        }
        self.watch_session(Arc::clone(coordinator));
        Ok(())
    }

    /// Undo a failed start. Returns false when the attempt had already been
    /// superseded by a stop, in which case shared state is left alone.
    async fn rollback(&self, coordinator: &Arc<ShutdownCoordinator>) -> bool {
        let owned = {
            let mut inner = self.shared.write();
            if inner.owns(coordinator) {
                // The bundle is never committed before the start succeeds
                inner.release();
                self.shared.transition(&mut inner, SessionState::Loaded);
                true
            } else {
                false
            }
        };
        coordinator.shutdown().await;
        owned
    }

    // === Session end ===

    fn watch_session(&self, coordinator: Arc<ShutdownCoordinator>) {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let token = coordinator.token();
            token.cancelled().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            SessionStateManager { shared }
                .on_session_ended(&coordinator)
                .await;
        });
    }

    /// React to the session token being cancelled from inside the session:
    /// a task failure, a termination signal, or the end of the video.
    async fn on_session_ended(&self, coordinator: &Arc<ShutdownCoordinator>) {
        let failure = coordinator.error();

        let bundle = {
            let mut inner = self.shared.write();
            if !inner.owns(coordinator) {
                debug!("session already released, ignoring end of stale session");
                return;
            }
            let (_, bundle) = inner.release();
            match &failure {
                Some(err) => {
                    inner.error_message = format!("{err:#}");
                    self.shared.transition(&mut inner, SessionState::Error);
                }
                None => self.shared.transition(&mut inner, SessionState::Loaded),
            }
            bundle
        };

        match &failure {
            Some(err) => warn!("session ended with error: {:#}", err),
            None => info!("session ended"),
        }

        coordinator.shutdown().await;
        drop(bundle);
    }
}

/// Scan, connect, and discover services. Every step observes `cancel`.
async fn connect_sensor(
    config: &SessionConfig,
    sensor: &dyn SensorClient,
    cancel: &CancellationToken,
) -> anyhow::Result<DeviceHandle> {
    let scan_timeout = Duration::from_secs(config.sensor.scan_timeout_secs);
    let found = match tokio::time::timeout(scan_timeout, sensor.scan(cancel)).await {
        Ok(result) => result.context("scanning for sensor")?,
        Err(_) => bail!(
            "no sensor found within {}s",
            config.sensor.scan_timeout_secs
        ),
    };
    info!(address = %found.address, name = %found.name, "found sensor");

    let device = sensor
        .connect(cancel, &found)
        .await
        .context("connecting to sensor")?;

    // Battery reporting is optional on most sensors
    let battery = async {
        cancellable(cancel, sensor.discover_battery_service(&device)).await?;
        let level = cancellable(cancel, sensor.discover_battery_level(&device)).await?;
        Ok::<_, anyhow::Error>(level)
    };
    match battery.await {
        Ok(level) => info!(battery = level, "sensor battery level"),
        Err(e) if cancel.is_cancelled() => return Err(e.context("discovering battery")),
        Err(e) => warn!("battery level unavailable: {:#}", e),
    }

    cancellable(cancel, sensor.discover_speed_services(&device))
        .await
        .context("discovering speed service")?;
    cancellable(cancel, sensor.discover_speed_characteristics(&device))
        .await
        .context("discovering speed characteristics")?;

    Ok(device)
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled"),
        result = fut => result,
    }
}
