//! pedalsync - keeps video playback speed in step with a cycling speed sensor.
//!
//! The core is three pieces:
//! - [`SessionStateManager`]: the session state machine and owner of the live collaborators
//! - [`ShutdownCoordinator`]: runs the session tasks under one token and tears them down in bounded time
//! - [`SyncLoop`]: turns smoothed sensor speed into playback-rate commands with hysteresis
//!
//! Media players and speed sensors are consumed through [`PlayerAdapter`] and
//! [`SensorClient`]. [`BackendRegistry`] picks implementations by name; the
//! built-in `"headless"` player and `"simulated"` sensor need no hardware.

pub mod backends;
pub mod error;
pub mod headless;
pub mod lifecycle;
pub mod player;
pub mod sensor;
pub mod session;
pub mod simulated;
pub mod sync;
pub mod telemetry;

pub use backends::{BackendRegistry, SessionFactory};
pub use error::{SessionError, TaskError};
pub use headless::HeadlessPlayer;
pub use lifecycle::ShutdownCoordinator;
pub use player::{OsdOptions, PlayerAdapter, PlayerEvent};
pub use sensor::{DeviceHandle, RadioLock, RollingSmoother, ScanResult, SensorClient, SpeedSmoother};
pub use session::{
    ConfigLoader, FileConfigLoader, ManagerOptions, SessionState, SessionStateManager,
    SessionStatus,
};
pub use simulated::{SimulatedSensor, SpeedProfile};
pub use sync::{PlaybackTelemetry, SyncError, SyncExit, SyncLoop, SyncSettings};
