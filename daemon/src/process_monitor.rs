use log::{debug, info};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};

use crate::config::{Config, MonitoredApp};
use crate::event::DaemonEvent;

/// Turns successive process-table snapshots into launch events.
///
/// An app "launches" when it is running in this snapshot but was not in the
/// previous one. Apps seen for the first time (daemon start, or freshly added
/// to the config) only establish a baseline, so something that was already
/// running never fires.
#[derive(Debug, Default)]
pub struct LaunchDetector {
    known: HashSet<PathBuf>,
    running: HashSet<PathBuf>,
}

impl LaunchDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, apps: &[MonitoredApp], exes: &[&Path]) -> Vec<MonitoredApp> {
        let mut launched = Vec::new();
        let mut now_running = HashSet::new();

        for app in apps {
            if !exes.iter().any(|exe| belongs_to(exe, &app.path)) {
                continue;
            }
            now_running.insert(app.path.clone());
            if self.known.contains(&app.path) && !self.running.contains(&app.path) {
                launched.push(app.clone());
            }
        }

        self.known = apps.iter().map(|a| a.path.clone()).collect();
        self.running = now_running;
        launched
    }
}

/// An executable belongs to an app if it is the app path itself or lives
/// anywhere inside it (e.g. `Foo.app/Contents/MacOS/Foo`).
fn belongs_to(exe: &Path, app: &Path) -> bool {
    exe.starts_with(app)
}

/// Polls the OS process list every `poll_interval_secs` seconds and emits
/// [`DaemonEvent::AppLaunched`] whenever a monitored application starts.
///
/// Runs until the event receiver is dropped.
pub async fn run(config: Arc<RwLock<Config>>, tx: mpsc::Sender<DaemonEvent>) {
    let mut sys = System::new();
    let mut detector = LaunchDetector::new();
    let refresh = ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet);

    loop {
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);
        let exes: Vec<PathBuf> = sys
            .processes()
            .values()
            .filter_map(|p| p.exe().map(Path::to_path_buf))
            .collect();
        let exe_refs: Vec<&Path> = exes.iter().map(PathBuf::as_path).collect();

        let (launched, interval) = {
            let config = config.read().await;
            (
                detector.observe(&config.applications, &exe_refs),
                config.settings.effective_poll_interval(),
            )
        };
        debug!("[monitor] Polled {} processes", exes.len());

        for app in launched {
            info!("[monitor] Launched: {}", app.display_name());
            if tx.send(DaemonEvent::AppLaunched(app)).await.is_err() {
                return;
            }
        }

        sleep(Duration::from_secs(interval)).await;
    }
}
