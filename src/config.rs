//! Daemon configuration.
//!
//! Two layers:
//! - [`DaemonConfig`] — typed startup configuration read once from
//!   `clarad.json`. Missing file means defaults; a present but malformed
//!   file is a startup error.
//! - [`ConfigMap`] — the runtime flat string map exposed over the control
//!   protocol (`config get` / `config set`). Every write goes through an
//!   atomic replace so readers never observe a torn file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CoreError;
use crate::store::checkpoint::atomic_replace;
use crate::types::ServiceDescriptor;

/// Default root of all daemon state.
pub const DEFAULT_DATA_DIR: &str = "/data/clara";

/// Default control socket path.
pub const DEFAULT_CONTROL_SOCKET: &str = "/data/clara/orchestrator.sock";

/// Typed startup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding sockets, stores, and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path of the control-plane listener socket.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Timing knobs; every field has a default.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Supervised services. Empty means the stock table.
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,

    /// Cron expression for the daily good-behavior tick.
    #[serde(default = "default_daily_tick_cron")]
    pub daily_tick_cron: String,
}

/// Timeouts, intervals, and capacity bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Health tick interval in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Settle time after spawning a child before probing liveness, in ms.
    #[serde(default = "default_spawn_settle_ms")]
    pub spawn_settle_ms: u64,

    /// Grace period between SIGTERM and SIGKILL on stop, in ms.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Continuous running time after which the restart counter resets, in
    /// seconds.
    #[serde(default = "default_restart_reset_secs")]
    pub restart_reset_secs: u64,

    /// Event bus inbound queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a producer blocks on a full queue before dropping, in ms.
    #[serde(default = "default_produce_timeout_ms")]
    pub produce_timeout_ms: u64,

    /// Bus drain deadline on shutdown, in ms.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,

    /// Budget for a single capability call, in ms.
    #[serde(default = "default_cap_timeout_ms")]
    pub cap_timeout_ms: u64,

    /// Per-operation socket read deadline, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Concurrent control-plane handlers.
    #[serde(default = "default_control_workers")]
    pub control_workers: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            spawn_settle_ms: default_spawn_settle_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_reset_secs: default_restart_reset_secs(),
            queue_capacity: default_queue_capacity(),
            produce_timeout_ms: default_produce_timeout_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
            cap_timeout_ms: default_cap_timeout_ms(),
            read_timeout_secs: default_read_timeout_secs(),
            control_workers: default_control_workers(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_daily_tick_cron() -> String {
    // Second-resolution cron: 03:00 every day.
    "0 0 3 * * *".to_owned()
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_spawn_settle_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_restart_reset_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_produce_timeout_ms() -> u64 {
    50
}

fn default_shutdown_drain_ms() -> u64 {
    2000
}

fn default_cap_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_secs() -> u64 {
    5
}

fn default_control_workers() -> usize {
    4
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            control_socket: default_control_socket(),
            timing: TimingConfig::default(),
            services: Vec::new(),
            daily_tick_cron: default_daily_tick_cron(),
        }
    }
}

impl DaemonConfig {
    /// Load from a JSON file, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] if the file exists but is not valid
    /// JSON, or [`CoreError::Transport`] on read failure.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            let mut config = Self::default();
            config.fill_stock_services();
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)
            .map_err(|e| CoreError::Protocol(format!("config {}: {e}", path.display())))?;
        config.fill_stock_services();
        info!(
            path = %path.display(),
            services = config.services.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Path of the trust record checkpoint file.
    pub fn trust_checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("trust.json")
    }

    /// Path of the append-only violation log.
    pub fn violation_log_path(&self) -> PathBuf {
        self.data_dir.join("violations.jsonl")
    }

    /// Path of the runtime flat string map.
    pub fn config_map_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Directory for rotated JSON log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Populate the stock service table when none is configured.
    fn fill_stock_services(&mut self) {
        if !self.services.is_empty() {
            return;
        }
        self.services = stock_services(&self.data_dir);
    }
}

/// The stock three-service table.
pub fn stock_services(data_dir: &Path) -> Vec<ServiceDescriptor> {
    ["security_core", "privacy_core", "app_manager"]
        .into_iter()
        .map(|name| ServiceDescriptor {
            name: name.to_owned(),
            binary_path: format!("/data/adb/modules/clara_security/system/bin/clara_{name}"),
            args: vec!["-f".to_owned()],
            socket_path: data_dir.join(format!("{name}.sock")).display().to_string(),
            auto_start: true,
            auto_restart: true,
            restart_delay_ms: 5000,
            max_restarts: 5,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Runtime flat string map
// ---------------------------------------------------------------------------

/// Flat string map persisted as a single JSON object.
///
/// A `BTreeMap` keeps the on-disk key order stable across rewrites.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigMap {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

impl ConfigMap {
    /// Load from disk; a missing file yields an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] on malformed JSON.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| CoreError::Protocol(format!("config map {}: {e}", path.display())))
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Set a key. The caller persists via [`ConfigMap::save`].
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist with an atomic replace (temp file, fsync, rename).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_replace(path, &bytes)
    }
}
