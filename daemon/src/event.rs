use crate::config::{Config, MonitoredApp};

pub enum DaemonEvent {
    /// A monitored application went from not running to running.
    AppLaunched(MonitoredApp),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The config file changed on disk but could not be read or parsed.
    /// The previous config stays in effect.
    ConfigError(String),
    /// Ctrl+C received; the watcher should write its final status and exit.
    Shutdown,
}
