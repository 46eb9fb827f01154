// Engine configuration: timeouts, backoff and breaker tunables.
// Stored as JSON in the platform config directory, loaded at startup.

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// All engine tunables. Durations are stored as milliseconds so the file
/// stays plain JSON. Defaults match the production backend's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the live messaging endpoint.
    pub socket_url: String,
    /// How long `send_with_ack` waits for a server acknowledgment.
    pub ack_timeout_ms: u64,
    /// Consecutive failed connect cycles before the circuit opens.
    pub max_failures: u32,
    /// Connect attempts per cycle.
    pub max_retries: u32,
    /// First reconnect delay; grows by 1.5x per attempt.
    pub initial_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    pub max_delay_ms: u64,
    /// Interval between heartbeat pings while connected.
    pub heartbeat_interval_ms: u64,
    /// Silence window after which the connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Trailing silence before an automatic stop-typing signal is sent.
    pub typing_stop_delay_ms: u64,
    /// How long remote typing state survives without a fresh signal.
    pub typing_expiry_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            socket_url: "ws://localhost:8080/ws".to_string(),
            ack_timeout_ms: 10_000,
            max_failures: 3,
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 60_000,
            typing_stop_delay_ms: 3_000,
            typing_expiry_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn typing_stop_delay(&self) -> Duration {
        Duration::from_millis(self.typing_stop_delay_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("convosync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("sync.json"))
}

pub fn save_config_to(path: &Path, config: &SyncConfig) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    Ok(())
}

pub fn save_config(config: &SyncConfig) -> Result<()> {
    let path = get_config_path()?;
    save_config_to(&path, config)?;
    info!("Engine configuration saved to {}", path.display());
    Ok(())
}

pub fn load_config_from(path: &Path) -> Result<SyncConfig> {
    let contents = fs::read_to_string(path)?;
    let config: SyncConfig = serde_json::from_str(&contents)?;
    Ok(config)
}

/// Loads the stored configuration, falling back to defaults when no file
/// exists yet. A missing file is not an error; a malformed one is.
pub fn load_config() -> Result<SyncConfig> {
    let path = get_config_path()?;
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let config = load_config_from(&path)?;
    info!("Loaded engine configuration from {}", path.display());
    Ok(config)
}
