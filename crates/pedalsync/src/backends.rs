//! Construction of per-session collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use pedalconf::SessionConfig;

use crate::headless::{HeadlessPlayer, DEFAULT_MEDIA_LENGTH};
use crate::player::PlayerAdapter;
use crate::sensor::{RollingSmoother, SensorClient, SpeedSmoother};
use crate::simulated::{SimulatedSensor, SpeedProfile};

/// Builds the collaborators for one session from its config snapshot.
pub trait SessionFactory: Send + Sync {
    fn smoother(&self, config: &SessionConfig) -> Arc<dyn SpeedSmoother> {
        Arc::new(RollingSmoother::new(config.speed.smoothing_window))
    }

    /// A fresh, unloaded player for `config.video.media_player`.
    fn player(&self, config: &SessionConfig) -> Result<Arc<dyn PlayerAdapter>>;

    /// A fresh, unconnected sensor client for `config.sensor.backend`.
    fn sensor(&self, config: &SessionConfig) -> Result<Arc<dyn SensorClient>>;
}

pub type PlayerConstructor =
    Box<dyn Fn(&SessionConfig) -> Result<Arc<dyn PlayerAdapter>> + Send + Sync>;

pub type SensorConstructor =
    Box<dyn Fn(&SessionConfig) -> Result<Arc<dyn SensorClient>> + Send + Sync>;

/// Name-keyed constructors for players and sensors.
///
/// [`BackendRegistry::default`] knows the built-in `"headless"` player and
/// `"simulated"` sensor. Hardware backends register under their own names.
pub struct BackendRegistry {
    players: HashMap<String, PlayerConstructor>,
    sensors: HashMap<String, SensorConstructor>,
}

impl BackendRegistry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            players: HashMap::new(),
            sensors: HashMap::new(),
        }
    }

    pub fn register_player<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&SessionConfig) -> Result<Arc<dyn PlayerAdapter>> + Send + Sync + 'static,
    {
        self.players.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn register_sensor<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&SessionConfig) -> Result<Arc<dyn SensorClient>> + Send + Sync + 'static,
    {
        self.sensors.insert(name.into(), Box::new(constructor));
        self
    }

    /// Registered player names, sorted.
    pub fn player_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.players.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered sensor names, sorted.
    pub fn sensor_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.sensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_player("headless", |_config| {
                Ok(Arc::new(HeadlessPlayer::new(DEFAULT_MEDIA_LENGTH)) as Arc<dyn PlayerAdapter>)
            })
            .register_sensor("simulated", |config| {
                Ok(Arc::new(SimulatedSensor::new(
                    config.sensor.address.clone(),
                    SpeedProfile::default(),
                )) as Arc<dyn SensorClient>)
            });
        registry
    }
}

impl SessionFactory for BackendRegistry {
    fn player(&self, config: &SessionConfig) -> Result<Arc<dyn PlayerAdapter>> {
        let name = config.video.media_player.as_str();
        let constructor = self.players.get(name).ok_or_else(|| {
            anyhow!(
                "unknown media player \"{}\" (available: {})",
                name,
                self.player_names().join(", ")
            )
        })?;
        constructor(config)
    }

    fn sensor(&self, config: &SessionConfig) -> Result<Arc<dyn SensorClient>> {
        let name = config.sensor.backend.as_str();
        let constructor = self.sensors.get(name).ok_or_else(|| {
            anyhow!(
                "unknown sensor backend \"{}\" (available: {})",
                name,
                self.sensor_names().join(", ")
            )
        })?;
        constructor(config)
    }
}
