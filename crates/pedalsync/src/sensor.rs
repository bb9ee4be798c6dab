//! Speed sensor contract and speed smoothing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;

/// A sensor seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub address: String,
    pub name: String,
}

/// A connected sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub name: String,
}

/// Turns raw sensor samples into a stable speed reading.
pub trait SpeedSmoother: Send + Sync {
    fn record(&self, speed: f64);

    /// Current smoothed speed. Zero when no samples have been recorded.
    fn smoothed_speed(&self) -> f64;

    fn reset(&self);
}

/// Client for a cycling speed sensor.
///
/// The connect sequence (`scan` through `discover_speed_characteristics`) runs
/// once per session; `run_updates` then feeds the smoother until cancelled.
#[async_trait]
pub trait SensorClient: Send + Sync {
    async fn scan(&self, cancel: &CancellationToken) -> Result<ScanResult>;

    async fn connect(&self, cancel: &CancellationToken, found: &ScanResult) -> Result<DeviceHandle>;

    async fn discover_battery_service(&self, device: &DeviceHandle) -> Result<()>;

    /// Battery charge in percent.
    async fn discover_battery_level(&self, device: &DeviceHandle) -> Result<u8>;

    async fn discover_speed_services(&self, device: &DeviceHandle) -> Result<()>;

    async fn discover_speed_characteristics(&self, device: &DeviceHandle) -> Result<()>;

    /// Stream speed notifications into `smoother`. Returns [`TaskError::Cancelled`]
    /// once `cancel` fires.
    async fn run_updates(
        &self,
        cancel: CancellationToken,
        smoother: Arc<dyn SpeedSmoother>,
    ) -> Result<(), TaskError>;

    /// Stop any scan still running on the radio. Called during teardown while
    /// holding the [`RadioLock`].
    fn stop_scan(&self);

    /// Last battery level reported, if the battery service was discovered.
    fn battery_level(&self) -> Option<u8>;
}

/// Serializes access to the radio adapter across sessions.
///
/// One instance is shared by everything in the process that touches the adapter.
#[derive(Debug, Clone, Default)]
pub struct RadioLock(Arc<Mutex<()>>);

impl RadioLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rolling mean over the most recent `window` samples.
#[derive(Debug)]
pub struct RollingSmoother {
    window: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl RollingSmoother {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<f64>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpeedSmoother for RollingSmoother {
    fn record(&self, speed: f64) {
        if !speed.is_finite() {
            debug!(speed, "ignoring non-finite speed sample");
            return;
        }
        let mut samples = self.samples();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(speed.max(0.0));
    }

    fn smoothed_speed(&self) -> f64 {
        let samples = self.samples();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    fn reset(&self) {
        self.samples().clear();
    }
}
