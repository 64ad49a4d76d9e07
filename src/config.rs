//! Supervisor configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::file_watcher::WatchHandlers;
use crate::supervisor::capture::{CaptureConfig, CaptureFormat};
use crate::supervisor::liveness::MonitorConfig;
use crate::supervisor::runner::LaunchParams;
use crate::{AppError, Result};

/// Liveness monitor timing settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorSettings {
    /// Seconds between sweeps; also the probe expiration.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Seconds without a heartbeat before a running instance is unresponsive.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Broker routing key for the status probe.
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            timeout_seconds: default_timeout(),
            routing_key: default_routing_key(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    30
}

fn default_routing_key() -> String {
    "admin".into()
}

/// Plugin output capture settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CaptureSettings {
    /// Whether plugin stdout/stderr is captured to sink files.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sink layout: `formatted` or `unformatted`.
    #[serde(default)]
    pub format: CaptureFormat,
    /// Minimum level kept by unformatted sinks.
    #[serde(default = "default_capture_level")]
    pub level: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            format: CaptureFormat::default(),
            level: default_capture_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_capture_level() -> String {
    "info".into()
}

/// Orchestrator shutdown behavior.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ShutdownSettings {
    /// Seconds between the graceful interrupt and the forced kill.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
        }
    }
}

fn default_grace_seconds() -> u64 {
    10
}

/// A single watched file and the events it publishes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchSettings {
    /// Exact file path to watch.
    pub path: PathBuf,
    /// Directory poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Event published when the file appears.
    pub created_event: Option<String>,
    /// Event published when the file content changes in place.
    pub modified_event: Option<String>,
    /// Event published when the file is renamed into or out of place.
    pub moved_event: Option<String>,
    /// Event published when the file disappears.
    pub deleted_event: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl WatchSettings {
    /// Handlers bound to this subscription.
    #[must_use]
    pub fn handlers(&self) -> WatchHandlers {
        WatchHandlers {
            created: self.created_event.clone(),
            modified: self.modified_event.clone(),
            moved: self.moved_event.clone(),
            deleted: self.deleted_event.clone(),
        }
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A plugin launched by the supervisor binary at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PluginSettings {
    /// Human-readable plugin name, used in logs only.
    pub name: String,
    /// Argument vector; the first element is the executable.
    pub args: Vec<String>,
    /// Working directory of the plugin process.
    pub working_dir: PathBuf,
    /// Environment passed to the plugin process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Supervisor configuration parsed from a TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// `SQLite` database file for instance records; in-memory when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Liveness monitor settings.
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Output capture settings shared by every runner.
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Stop escalation settings.
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    /// Optional file watch subscription.
    #[serde(default)]
    pub watch: Option<WatchSettings>,
    /// Plugins launched at startup.
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginSettings>,
}

impl SupervisorConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the immutable capture configuration injected into each runner.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the capture level is not a known level.
    pub fn capture_config(&self) -> Result<CaptureConfig> {
        let level = self
            .capture
            .level
            .parse()
            .map_err(|_| AppError::Config(format!("unknown capture level: {}", self.capture.level)))?;
        Ok(CaptureConfig {
            format: self.capture.format,
            min_level: level,
        })
    }

    /// Build the liveness monitor configuration.
    #[must_use]
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            period: Duration::from_secs(self.monitor.heartbeat_interval_seconds),
            timeout: Duration::from_secs(self.monitor.timeout_seconds),
            routing_key: self.monitor.routing_key.clone(),
        }
    }

    /// Launch parameters for every configured plugin.
    #[must_use]
    pub fn launch_params(&self) -> Vec<(String, LaunchParams)> {
        self.plugins
            .iter()
            .map(|plugin| {
                (
                    plugin.name.clone(),
                    LaunchParams {
                        args: plugin.args.clone(),
                        working_dir: plugin.working_dir.clone(),
                        env: plugin.env.clone(),
                        capture_streams: self.capture.enabled,
                    },
                )
            })
            .collect()
    }

    /// Grace period between terminate and kill on shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.monitor.heartbeat_interval_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.monitor.timeout_seconds == 0 {
            return Err(AppError::Config(
                "timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.monitor.routing_key.trim().is_empty() {
            return Err(AppError::Config("routing_key must not be empty".into()));
        }

        self.capture_config()?;

        if let Some(watch) = &self.watch {
            if watch.poll_interval_ms == 0 {
                return Err(AppError::Config(
                    "watch.poll_interval_ms must be greater than zero".into(),
                ));
            }
            if watch.path.file_name().is_none() {
                return Err(AppError::Config(format!(
                    "watch.path '{}' does not name a file",
                    watch.path.display()
                )));
            }
        }

        for plugin in &self.plugins {
            if plugin.args.is_empty() {
                return Err(AppError::Config(format!(
                    "plugin '{}' has an empty argument vector",
                    plugin.name
                )));
            }
        }

        Ok(())
    }
}
