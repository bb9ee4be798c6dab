//! Sensor backend that synthesizes a ride.
//!
//! Produces a deterministic speed profile: a linear warm-up to a cruising
//! speed, then a slow sine wave around it. Every wait honors the cancellation
//! token, matching what a radio-backed client has to do.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TaskError;
use crate::sensor::{DeviceHandle, ScanResult, SensorClient, SpeedSmoother};

const SIMULATED_ADDRESS: &str = "5E:NS:0R:00:00:01";
const BATTERY_UNKNOWN: u8 = u8::MAX;

/// Shape of the synthesized ride.
#[derive(Debug, Clone)]
pub struct SpeedProfile {
    /// Cruising speed reached after warm-up.
    pub cruise_speed: f64,
    /// Peak deviation from cruising speed.
    pub amplitude: f64,
    pub period: Duration,
    pub warmup: Duration,
    pub sample_interval: Duration,
    /// Delay before the scan reports the device.
    pub scan_delay: Duration,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self {
            cruise_speed: 22.0,
            amplitude: 4.0,
            period: Duration::from_secs(90),
            warmup: Duration::from_secs(15),
            sample_interval: Duration::from_millis(500),
            scan_delay: Duration::from_millis(300),
        }
    }
}

impl SpeedProfile {
    /// Speed `elapsed` into the ride.
    pub fn speed_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        let warmup = self.warmup.as_secs_f64();
        if t < warmup {
            return self.cruise_speed * t / warmup;
        }
        let phase = (t - warmup) / self.period.as_secs_f64().max(f64::EPSILON);
        (self.cruise_speed + self.amplitude * (phase * TAU).sin()).max(0.0)
    }
}

pub struct SimulatedSensor {
    address: String,
    profile: SpeedProfile,
    battery: AtomicU8,
    scanning: AtomicBool,
}

impl SimulatedSensor {
    /// `address` empty means "accept the default simulated device".
    pub fn new(address: impl Into<String>, profile: SpeedProfile) -> Self {
        let address = address.into();
        let address = if address.is_empty() {
            SIMULATED_ADDRESS.to_string()
        } else {
            address
        };
        Self {
            address,
            profile,
            battery: AtomicU8::new(BATTERY_UNKNOWN),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorClient for SimulatedSensor {
    async fn scan(&self, cancel: &CancellationToken) -> Result<ScanResult> {
        self.scanning.store(true, Ordering::SeqCst);
        debug!(address = %self.address, "scanning for simulated sensor");

        tokio::select! {
            _ = cancel.cancelled() => {
                self.scanning.store(false, Ordering::SeqCst);
                bail!("scan cancelled");
            }
            _ = tokio::time::sleep(self.profile.scan_delay) => {}
        }

        self.scanning.store(false, Ordering::SeqCst);
        Ok(ScanResult {
            address: self.address.clone(),
            name: "Simulated CSC".to_string(),
        })
    }

    async fn connect(&self, cancel: &CancellationToken, found: &ScanResult) -> Result<DeviceHandle> {
        if cancel.is_cancelled() {
            bail!("connect cancelled");
        }
        info!(address = %found.address, "connected to simulated sensor");
        Ok(DeviceHandle {
            address: found.address.clone(),
            name: found.name.clone(),
        })
    }

    async fn discover_battery_service(&self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    async fn discover_battery_level(&self, _device: &DeviceHandle) -> Result<u8> {
        let level = 87;
        self.battery.store(level, Ordering::SeqCst);
        Ok(level)
    }

    async fn discover_speed_services(&self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    async fn discover_speed_characteristics(&self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    async fn run_updates(
        &self,
        cancel: CancellationToken,
        smoother: Arc<dyn SpeedSmoother>,
    ) -> Result<(), TaskError> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.profile.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("simulated sensor updates stopping");
                    return Err(TaskError::Cancelled);
                }
                _ = ticker.tick() => {
                    smoother.record(self.profile.speed_at(started.elapsed()));
                }
            }
        }
    }

    fn stop_scan(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            debug!("stopped simulated scan");
        }
    }

    fn battery_level(&self) -> Option<u8> {
        match self.battery.load(Ordering::SeqCst) {
            BATTERY_UNKNOWN => None,
            level => Some(level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::RollingSmoother;

    #[test]
    fn test_profile_warmup_is_linear() {
        let profile = SpeedProfile::default();
        assert_eq!(profile.speed_at(Duration::ZERO), 0.0);
        let halfway = profile.speed_at(profile.warmup / 2);
        assert!((halfway - profile.cruise_speed / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_profile_stays_near_cruise() {
        let profile = SpeedProfile::default();
        for secs in [20, 45, 60, 120, 600] {
            let speed = profile.speed_at(Duration::from_secs(secs));
            assert!((speed - profile.cruise_speed).abs() <= profile.amplitude + 1e-9);
        }
    }

    #[tokio::test]
    async fn test_scan_honors_cancel() {
        let sensor = SimulatedSensor::new(
            "",
            SpeedProfile {
                scan_delay: Duration::from_secs(60),
                ..SpeedProfile::default()
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sensor.scan(&cancel).await.is_err());
        assert!(!sensor.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_feed_smoother_until_cancelled() {
        let sensor = Arc::new(SimulatedSensor::new("AA:BB", SpeedProfile::default()));
        let smoother: Arc<dyn SpeedSmoother> = Arc::new(RollingSmoother::new(3));
        let cancel = CancellationToken::new();

        let task = {
            let sensor = Arc::clone(&sensor);
            let smoother = Arc::clone(&smoother);
            let cancel = cancel.clone();
            tokio::spawn(async move { sensor.run_updates(cancel, smoother).await })
        };

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(smoother.smoothed_speed() > 0.0);

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn test_battery_unknown_until_discovered() {
        let sensor = SimulatedSensor::new("", SpeedProfile::default());
        assert_eq!(sensor.battery_level(), None);

        let cancel = CancellationToken::new();
        let found = ScanResult {
            address: SIMULATED_ADDRESS.to_string(),
            name: "sim".to_string(),
        };
        let device = sensor.connect(&cancel, &found).await.unwrap();
        sensor.discover_battery_level(&device).await.unwrap();
        assert_eq!(sensor.battery_level(), Some(87));
    }
}
