//! pedalsync - ride along with a video at the speed you pedal.
//!
//! Subcommands:
//! - `pedalsync run` - Load the session config, connect, and sync until the video ends or a signal arrives
//! - `pedalsync check` - Validate the layered config and list where values came from
//! - `pedalsync show-config` - Print the effective config as TOML

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pedalconf::{ConfigError, SessionConfig};
use pedalsync::{
    telemetry, BackendRegistry, ConfigLoader, ManagerOptions, SessionState, SessionStateManager,
};
use tokio::time::MissedTickBehavior;

/// Interval between status lines while a session runs.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pedalsync")]
#[command(about = "Keep video playback speed in step with a cycling speed sensor")]
#[command(version)]
struct Cli {
    /// Session config file, read after the system and user config files
    #[arg(short, long, global = true, env = "PEDALSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. "debug" or "pedalsync=trace"). RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a session until the video ends or SIGINT/SIGTERM
    Run {
        /// Override the shutdown timeout in milliseconds
        #[arg(long)]
        shutdown_timeout_ms: Option<u64>,
    },

    /// Validate the configuration and list its sources
    Check,

    /// Print the effective configuration as TOML
    ShowConfig,
}

/// Resolves the session file through the same layers as `check`.
struct LayeredConfigLoader;

impl ConfigLoader for LayeredConfigLoader {
    fn load(&self, path: &Path) -> Result<SessionConfig, ConfigError> {
        let (config, _sources) = SessionConfig::load_with_sources_from(Some(path))?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            shutdown_timeout_ms,
        } => run(cli.config, cli.log_level, shutdown_timeout_ms).await,
        Commands::Check => {
            telemetry::init(cli.log_level.as_deref().unwrap_or("warn"))?;
            check(cli.config.as_deref())
        }
        Commands::ShowConfig => {
            telemetry::init(cli.log_level.as_deref().unwrap_or("warn"))?;
            show_config(cli.config.as_deref())
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    shutdown_timeout_ms: Option<u64>,
) -> Result<()> {
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("pedalsync.toml"));

    // Logging follows the session file unless overridden on the command line
    let (config, _sources) = SessionConfig::load_with_sources_from(Some(&config_path))
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let level = log_level.unwrap_or_else(|| config.app.log_level.clone());
    telemetry::init(&level)?;

    let manager = SessionStateManager::with_options(
        Arc::new(LayeredConfigLoader),
        Arc::new(BackendRegistry::default()),
        ManagerOptions {
            shutdown_timeout: shutdown_timeout_ms.map(Duration::from_millis),
            handle_signals: true,
            ..ManagerOptions::default()
        },
    );

    manager
        .load_session(&config_path)
        .context("Failed to load session")?;
    let mut states = manager.subscribe();

    tracing::info!(
        video = %config.video.file_path.display(),
        sensor = %config.sensor.backend,
        player = %config.video.media_player,
        "starting session"
    );
    manager
        .start_session()
        .await
        .context("Failed to start session")?;

    let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if !state.is_active() {
                    break;
                }
            }
            _ = status_tick.tick() => {
                let status = manager.status();
                tracing::info!(
                    state = %status.state,
                    speed = %format!("{:.1}", status.current_speed),
                    rate = %format!("{:.2}", status.playback_rate),
                    remaining = %status.time_remaining,
                    battery = status.battery_level,
                    "status"
                );
            }
        }
    }

    let status = manager.status();
    if status.state == SessionState::Error {
        bail!("session failed: {}", status.error_message);
    }

    tracing::info!(state = %status.state, "session finished");
    Ok(())
}

fn check(config_path: Option<&Path>) -> Result<()> {
    let (config, sources) =
        SessionConfig::load_with_sources_from(config_path).context("Configuration is invalid")?;

    println!("Configuration OK");
    if sources.files.is_empty() {
        println!("  files: (defaults only)");
    }
    for file in &sources.files {
        println!("  file: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("  env:  {}", var);
    }
    println!("  video: {}", config.video.file_path.display());
    println!(
        "  backends: player={} sensor={}",
        config.video.media_player, config.sensor.backend
    );
    Ok(())
}

fn show_config(config_path: Option<&Path>) -> Result<()> {
    let (config, _sources) =
        SessionConfig::load_with_sources_from(config_path).context("Failed to load configuration")?;
    print!("{}", config.to_toml());
    Ok(())
}
