use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current operational state of the watcher.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Not running, or shutting down.
    Idle,
    /// Polling the process table for monitored launches.
    Watching,
}

/// Runtime status written by `chime watch` to `status.toml` next to the config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Number of applications currently monitored.
    pub monitored_apps: usize,
    /// Display name of the most recently launched monitored application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_launch: Option<String>,
    /// RFC 3339 timestamp of `last_launch`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_launch_timestamp: Option<String>,
    /// Most recent non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            monitored_apps: 0,
            last_launch: None,
            last_launch_timestamp: None,
            error: None,
        }
    }

    /// Records a launch at the current local time.
    pub fn record_launch(&mut self, display_name: &str) {
        self.last_launch = Some(display_name.to_string());
        self.last_launch_timestamp = Some(chrono::Local::now().to_rfc3339());
    }

    /// Remembers the most recent non-fatal error until it is cleared.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }
}

/// Writes `status` to `path`, logging instead of failing: the watcher keeps
/// running even when its status file cannot be written.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Err(e) = try_write_status(path, status) {
        warn!("[status] {e:#}");
    }
}

fn try_write_status(path: &Path, status: &DaemonStatus) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(status).context("Failed to serialize status")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write status file {}", path.display()))
}
