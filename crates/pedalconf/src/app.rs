//! Process-level settings: logging and teardown bounds.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// `tracing` filter directive. `RUST_LOG` wins when set.
    /// Default: info
    #[serde(default = "AppConfig::default_log_level")]
    pub log_level: String,

    /// How long a stopping session waits for its tasks before forcing teardown.
    /// Default: 5000
    #[serde(default = "AppConfig::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl AppConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_shutdown_timeout_ms() -> u64 {
        5000
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "app.shutdown_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            shutdown_timeout_ms: Self::default_shutdown_timeout_ms(),
        }
    }
}
