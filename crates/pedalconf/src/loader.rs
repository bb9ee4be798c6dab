//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, SessionConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override. It is returned
/// even when missing so the caller gets a read error naming the file the user asked for.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/pedalsync/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("pedalsync/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("pedalsync.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deserialize a merged table into a config, filling defaults and expanding paths.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<SessionConfig, ConfigError> {
    let mut config: SessionConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.video.file_path = expand_path(&config.video.file_path.to_string_lossy());
    Ok(config)
}

/// Merge `overlay` into `base`, recursing into nested tables. Scalars and arrays in
/// `overlay` replace those in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SessionConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from<F>(config: &mut SessionConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Only overrides that were actually applied are recorded
    let mut applied = |key: &str| sources.env_overrides.push(key.to_string());

    if let Some(v) = lookup("PEDALSYNC_SENSOR_BACKEND") {
        config.sensor.backend = v;
        applied("PEDALSYNC_SENSOR_BACKEND");
    }
    if let Some(v) = lookup("PEDALSYNC_SENSOR_ADDRESS") {
        config.sensor.address = v;
        applied("PEDALSYNC_SENSOR_ADDRESS");
    }
    if let Some(v) = lookup("PEDALSYNC_MEDIA_PLAYER") {
        config.video.media_player = v;
        applied("PEDALSYNC_MEDIA_PLAYER");
    }
    if let Some(v) = lookup("PEDALSYNC_VIDEO_FILE") {
        config.video.file_path = expand_path(&v);
        applied("PEDALSYNC_VIDEO_FILE");
    }
    if let Some(units) = lookup("PEDALSYNC_SPEED_UNITS").and_then(|v| v.parse().ok()) {
        config.speed.speed_units = units;
        applied("PEDALSYNC_SPEED_UNITS");
    }
    if let Some(multiplier) = lookup("PEDALSYNC_SPEED_MULTIPLIER").and_then(|v| v.parse().ok()) {
        config.video.speed_multiplier = multiplier;
        applied("PEDALSYNC_SPEED_MULTIPLIER");
    }
    if let Some(v) = lookup("PEDALSYNC_LOG_LEVEL") {
        config.app.log_level = v;
        applied("PEDALSYNC_LOG_LEVEL");
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(slash_pos) => (&stripped[..slash_pos], &stripped[slash_pos + 1..]),
            None => (stripped, ""),
        };
        if let Ok(var_value) = env::var(var_name) {
            let base = PathBuf::from(var_value);
            return if rest.is_empty() { base } else { base.join(rest) };
        }
    }

    PathBuf::from(path)
}
