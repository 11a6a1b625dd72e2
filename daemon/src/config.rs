use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::event::DaemonEvent;
use crate::ledger::ReplacementLedger;
use crate::paths;

pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

#[cfg(target_os = "macos")]
pub const DEFAULT_PLAYER: &str = "afplay";
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_PLAYER: &str = "paplay";

/// Everything Chime persists. Deserialized from `<config dir>/chime/config.toml`
/// and rewritten in full after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Monitored applications and their launch sounds.
    #[serde(default)]
    pub applications: Vec<MonitoredApp>,
    /// Per-application file used to prefill replacement targets.
    #[serde(default)]
    pub default_sources: BTreeMap<PathBuf, PathBuf>,
    /// Active sound replacements, keyed by the original file path.
    #[serde(default)]
    pub replacements: ReplacementLedger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Library of launch sounds. Relative sound names resolve against it.
    #[serde(default = "default_sounds_dir")]
    pub sounds_dir: PathBuf,
    /// Program invoked with the sound file as its last argument.
    #[serde(default = "default_player")]
    pub player: String,
    /// Extra arguments passed before the sound file.
    #[serde(default)]
    pub player_args: Vec<String>,
    /// How often the process table is polled. Clamped to [1, 60].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sounds_dir: default_sounds_dir(),
            player: default_player(),
            player_args: Vec::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Settings {
    pub fn effective_poll_interval(&self) -> u64 {
        self.poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)
    }

    /// Absolute sound paths are used as-is; anything else is a file name in
    /// the sound library.
    pub fn resolve_sound(&self, sound: &str) -> PathBuf {
        let path = Path::new(sound);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sounds_dir.join(path)
        }
    }
}

/// An application whose launches trigger a sound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredApp {
    /// Bundle or executable path. Any process whose executable lives at or
    /// under this path counts as the app.
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

impl MonitoredApp {
    /// Final path component, used in log lines and listings.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl Config {
    pub fn app(&self, path: &Path) -> Option<&MonitoredApp> {
        self.applications.iter().find(|a| a.path == path)
    }

    pub fn app_mut(&mut self, path: &Path) -> Option<&mut MonitoredApp> {
        self.applications.iter_mut().find(|a| a.path == path)
    }

    pub fn default_source(&self, app: &Path) -> Option<&Path> {
        self.default_sources.get(app).map(PathBuf::as_path)
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!("[config] {} not found; starting empty", path.display());
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Serializes `config` and replaces the file at `path` with it.
///
/// The new content goes to a sibling temp file first and is renamed into place,
/// so a reader never sees a half-written file.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
    debug!("[config] Saved {}", path.display());
    Ok(())
}

/// Re-reads the config after it changed on disk. A file that no longer parses
/// becomes [`DaemonEvent::ConfigError`] so the watcher can report it while it
/// keeps the config it already has.
pub fn reload_event(path: &Path) -> DaemonEvent {
    match load_or_default(path) {
        Ok(config) => DaemonEvent::ConfigReloaded(config),
        Err(e) => {
            warn!("[config] Failed to reload config: {e:#}");
            DaemonEvent::ConfigError(format!("{e:#}"))
        }
    }
}

/// True for notify events that create or modify the config file itself.
/// [`save`] renames a temp sibling into place, which shows up as a create of
/// the config path.
fn is_config_write(event: &notify::Event, path: &Path) -> bool {
    let is_write = matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_)
    );
    is_write && event.paths.iter().any(|p| p == path)
}

/// Watches the config file's directory and sends a reload (or reload error)
/// event for every change to the file. Runs until the receiver is dropped.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("[config] Failed to create file watcher: {e}");
            return;
        }
    };

    // A watch on the file itself is tied to its inode, which `save` replaces
    // with every rename; the directory watch survives that.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!("[config] Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        error!("[config] Failed to create {}: {e}", watch_dir.display());
        return;
    }

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("[config] Failed to watch config directory: {e}");
        return;
    }
    info!("[config] Watching {}", path.display());

    while let Some(event) = watch_rx.recv().await {
        if !is_config_write(&event, &path) {
            continue;
        }
        if tx.send(reload_event(&path)).await.is_err() {
            break;
        }
    }
}

fn default_sounds_dir() -> PathBuf {
    paths::default_sounds_dir()
}

fn default_player() -> String {
    DEFAULT_PLAYER.to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
