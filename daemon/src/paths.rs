/// Canonical file paths for Chime data files.
///
/// Everything lives under the platform config directory:
///   - config.toml  Written by every mutating command, read by the watcher.
///   - status.toml  Written by the watcher, informational only.
///   - sounds/      Default launch-sound library.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "chime";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const SOUNDS_DIR_NAME: &str = "sounds";

/// Returns the Chime data directory, e.g. `~/.config/chime` or
/// `~/Library/Application Support/chime`. Falls back to `./chime` when the
/// platform has no config directory.
pub fn app_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// The status file sits next to whichever config file is in use.
pub fn status_file_path_for(config_path: &std::path::Path) -> PathBuf {
    config_path
        .parent()
        .map(|p| p.join(STATUS_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(STATUS_FILE_NAME))
}

pub fn default_sounds_dir() -> PathBuf {
    app_data_dir().join(SOUNDS_DIR_NAME)
}
