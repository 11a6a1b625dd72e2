/// The single owner of Chime's mutable state.
///
/// Every user action goes through [`ChimeService`], which mutates the loaded
/// [`Config`] (including the replacement ledger) and rewrites the config file
/// after each successful change. Front ends that need to refresh a view
/// register a callback with [`ChimeService::subscribe`] instead of polling.
use log::{error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{self, Config, MonitoredApp, Settings};
use crate::ledger::{LedgerError, OverwritePolicy, ReplacementRecord, RevertOutcome};
use crate::scan::{self, ScanError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{} is already monitored", .0.display())]
    AlreadyMonitored(PathBuf),
    #[error("{} is not monitored", .0.display())]
    NotMonitored(PathBuf),
    #[error("path does not exist: {}", .0.display())]
    PathMissing(PathBuf),
    #[error("{} has no default replacement source", .0.display())]
    NoDefaultSource(PathBuf),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to save configuration: {0:#}")]
    Save(anyhow::Error),
}

/// What changed, delivered to subscribers after the config was saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    AppAdded(PathBuf),
    AppRemoved(PathBuf),
    SoundChanged(PathBuf),
    DefaultSourceChanged(PathBuf),
    ReplacementApplied(PathBuf),
    ReplacementReverted(PathBuf),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (what, path) = match self {
            Change::AppAdded(p) => ("now monitoring", p),
            Change::AppRemoved(p) => ("stopped monitoring", p),
            Change::SoundChanged(p) => ("launch sound changed for", p),
            Change::DefaultSourceChanged(p) => ("default source changed for", p),
            Change::ReplacementApplied(p) => ("replaced", p),
            Change::ReplacementReverted(p) => ("reverted", p),
        };
        write!(f, "{what} {}", path.display())
    }
}

/// Outcome of [`ChimeService::remove_app`]. Partial failures are not rolled back.
#[derive(Debug, Default)]
pub struct RemovalSummary {
    /// Records dropped, whether or not a backup was restored.
    pub reverted: usize,
    /// Originals whose symlink was removed but whose backup was missing.
    pub missing_backups: Vec<PathBuf>,
    /// Originals that could not be reverted; their records are kept.
    pub failures: Vec<(PathBuf, LedgerError)>,
}

impl RemovalSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// An active replacement shown relative to its application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveReplacement {
    pub original: PathBuf,
    pub relative: PathBuf,
    pub record: ReplacementRecord,
}

/// A replaceable sound found inside an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// The app's default source, offered as the target.
    pub prefill: Option<PathBuf>,
    /// Set when the file is already replaced.
    pub active: Option<ReplacementRecord>,
}

type Observer = Box<dyn Fn(&Change)>;

pub struct ChimeService {
    config_path: PathBuf,
    config: Config,
    observers: Vec<Observer>,
}

impl ChimeService {
    /// Loads the config at `config_path`; a missing file starts empty.
    pub fn load(config_path: PathBuf) -> anyhow::Result<Self> {
        let config = config::load_or_default(&config_path)?;
        Ok(Self::with_config(config_path, config))
    }

    pub fn with_config(config_path: PathBuf, config: Config) -> Self {
        Self {
            config_path,
            config,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Registers `observer` to be called after every successful mutation.
    pub fn subscribe(&mut self, observer: impl Fn(&Change) + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn commit(&self, change: Change) -> Result<(), ServiceError> {
        config::save(&self.config_path, &self.config).map_err(ServiceError::Save)?;
        for observer in &self.observers {
            observer(&change);
        }
        Ok(())
    }

    fn require_app(&self, app: &Path) -> Result<&MonitoredApp, ServiceError> {
        self.config
            .app(app)
            .ok_or_else(|| ServiceError::NotMonitored(app.to_path_buf()))
    }

    // ── applications ──────────────────────────────────────────────────────────

    /// Starts monitoring `app`. Its launch sound defaults to the first file in
    /// the sound library, if there is one.
    pub fn add_app(&mut self, app: &Path) -> Result<&MonitoredApp, ServiceError> {
        if !app.exists() {
            return Err(ServiceError::PathMissing(app.to_path_buf()));
        }
        if self.config.app(app).is_some() {
            return Err(ServiceError::AlreadyMonitored(app.to_path_buf()));
        }

        let sound = match scan::list_library(&self.config.settings.sounds_dir) {
            Ok(names) => names.into_iter().next(),
            Err(e) => {
                warn!("[service] Could not read sound library: {e}");
                None
            }
        };
        self.config.applications.push(MonitoredApp {
            path: app.to_path_buf(),
            sound,
        });
        info!("[service] Monitoring {}", app.display());
        self.commit(Change::AppAdded(app.to_path_buf()))?;
        self.require_app(app)
    }

    /// Sets or clears the launch sound. A sound name must resolve to an
    /// existing file.
    pub fn set_sound(&mut self, app: &Path, sound: Option<String>) -> Result<(), ServiceError> {
        self.require_app(app)?;
        if let Some(name) = sound.as_deref() {
            let resolved = self.config.settings.resolve_sound(name);
            if !resolved.exists() {
                return Err(ServiceError::PathMissing(resolved));
            }
        }
        if let Some(entry) = self.config.app_mut(app) {
            entry.sound = sound;
        }
        self.commit(Change::SoundChanged(app.to_path_buf()))
    }

    pub fn set_default_source(
        &mut self,
        app: &Path,
        source: Option<PathBuf>,
    ) -> Result<(), ServiceError> {
        self.require_app(app)?;
        match source {
            Some(source) => {
                if !source.exists() {
                    return Err(ServiceError::PathMissing(source));
                }
                self.config.default_sources.insert(app.to_path_buf(), source);
            }
            None => {
                if self.config.default_sources.remove(app).is_none() {
                    // Nothing to clear; don't rewrite the file.
                    return Ok(());
                }
            }
        }
        self.commit(Change::DefaultSourceChanged(app.to_path_buf()))
    }

    /// Stops monitoring `app`, first reverting every replacement under its
    /// directory tree. Failed reverts are collected, not rolled back, and do
    /// not prevent the app from being removed.
    pub fn remove_app(&mut self, app: &Path) -> Result<RemovalSummary, ServiceError> {
        self.require_app(app)?;

        let originals: Vec<PathBuf> = self
            .config
            .replacements
            .records_under(app)
            .map(|(original, _)| original.clone())
            .collect();

        let mut summary = RemovalSummary::default();
        for original in originals {
            match self.config.replacements.revert(&original) {
                Ok(RevertOutcome::Restored) => summary.reverted += 1,
                Ok(RevertOutcome::BackupMissing { .. }) => {
                    summary.reverted += 1;
                    summary.missing_backups.push(original);
                }
                Err(e) => {
                    error!("[service] Could not revert {}: {e}", original.display());
                    summary.failures.push((original, e));
                }
            }
        }

        self.config.applications.retain(|a| a.path != app);
        if self.config.default_sources.remove(app).is_some() {
            info!("[service] Removed default source for {}", app.display());
        }
        info!(
            "[service] Stopped monitoring {} ({} reverted, {} failed)",
            app.display(),
            summary.reverted,
            summary.failed()
        );
        self.commit(Change::AppRemoved(app.to_path_buf()))?;
        Ok(summary)
    }

    // ── replacements ──────────────────────────────────────────────────────────

    pub fn apply_replacement(
        &mut self,
        original: &Path,
        target: &Path,
        policy: &mut dyn OverwritePolicy,
    ) -> Result<ReplacementRecord, ServiceError> {
        let record = self.config.replacements.apply(original, target, policy)?;
        self.commit(Change::ReplacementApplied(original.to_path_buf()))?;
        Ok(record)
    }

    /// Applies `app`'s default source to `original`.
    pub fn apply_default_source(
        &mut self,
        app: &Path,
        original: &Path,
        policy: &mut dyn OverwritePolicy,
    ) -> Result<ReplacementRecord, ServiceError> {
        let target = self
            .config
            .default_source(app)
            .map(Path::to_path_buf)
            .ok_or_else(|| ServiceError::NoDefaultSource(app.to_path_buf()))?;
        self.apply_replacement(original, &target, policy)
    }

    pub fn revert_replacement(&mut self, original: &Path) -> Result<RevertOutcome, ServiceError> {
        let outcome = self.config.replacements.revert(original)?;
        self.commit(Change::ReplacementReverted(original.to_path_buf()))?;
        Ok(outcome)
    }

    /// Active replacements under `app`, with paths relative to it.
    pub fn replacements_for(&self, app: &Path) -> Vec<ActiveReplacement> {
        self.config
            .replacements
            .records_under(app)
            .map(|(original, record)| ActiveReplacement {
                original: original.clone(),
                relative: original.strip_prefix(app).unwrap_or(original).to_path_buf(),
                record: record.clone(),
            })
            .collect()
    }

    /// Replaceable sounds inside `app`, each paired with the app's default
    /// source and its current replacement, if any.
    pub fn candidates(
        &self,
        app: &Path,
        subdir: Option<&Path>,
    ) -> Result<Vec<Candidate>, ServiceError> {
        let prefill = self.config.default_source(app).map(Path::to_path_buf);
        let found = scan::scan_candidates(app, subdir)?;
        Ok(found
            .into_iter()
            .map(|path| Candidate {
                active: self.config.replacements.get(&path).cloned(),
                prefill: prefill.clone(),
                path,
            })
            .collect())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;

    struct Fixture {
        dir: tempfile::TempDir,
        service: ChimeService,
    }

    impl Fixture {
        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn reload(&self) -> Config {
            config::load_or_default(self.service.config_path()).unwrap()
        }
    }

    fn write(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.settings.sounds_dir = dir.path().join("sounds");
        let service = ChimeService::with_config(dir.path().join("config.toml"), config);
        Fixture { dir, service }
    }

    fn never(_: &Path) -> bool {
        false
    }

    // ── applications ──────────────────────────────────────────────────────────

    #[test]
    fn add_app_defaults_to_first_library_sound_and_persists() {
        let mut f = fixture();
        write(&f.path("sounds/b.wav"), b"b");
        write(&f.path("sounds/a.mp3"), b"a");
        let app = f.path("Foo.app");
        fs::create_dir_all(&app).unwrap();

        let added = f.service.add_app(&app).unwrap();
        assert_eq!(added.sound.as_deref(), Some("a.mp3"));

        let saved = f.reload();
        assert_eq!(saved.applications.len(), 1);
        assert_eq!(saved.applications[0].path, app);
    }

    #[test]
    fn add_app_twice_is_rejected() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        fs::create_dir_all(&app).unwrap();
        f.service.add_app(&app).unwrap();
        assert!(matches!(
            f.service.add_app(&app),
            Err(ServiceError::AlreadyMonitored(_))
        ));
    }

    #[test]
    fn add_missing_app_is_rejected() {
        let mut f = fixture();
        let app = f.path("Missing.app");
        assert!(matches!(f.service.add_app(&app), Err(ServiceError::PathMissing(_))));
        assert!(!f.service.config_path().exists());
    }

    #[test]
    fn set_sound_validates_and_persists() {
        let mut f = fixture();
        write(&f.path("sounds/ding.wav"), b"d");
        let app = f.path("Foo.app");
        fs::create_dir_all(&app).unwrap();
        f.service.add_app(&app).unwrap();

        assert!(matches!(
            f.service.set_sound(&app, Some("nope.wav".into())),
            Err(ServiceError::PathMissing(_))
        ));

        f.service.set_sound(&app, None).unwrap();
        assert_eq!(f.reload().applications[0].sound, None);

        f.service.set_sound(&app, Some("ding.wav".into())).unwrap();
        assert_eq!(f.reload().applications[0].sound.as_deref(), Some("ding.wav"));
    }

    #[test]
    fn set_sound_on_unmonitored_app_fails() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        assert!(matches!(
            f.service.set_sound(&app, None),
            Err(ServiceError::NotMonitored(_))
        ));
    }

    #[test]
    fn default_source_set_and_clear() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let source = f.path("Desktop/pop.wav");
        fs::create_dir_all(&app).unwrap();
        write(&source, b"pop");
        f.service.add_app(&app).unwrap();

        f.service.set_default_source(&app, Some(source.clone())).unwrap();
        assert_eq!(f.reload().default_source(&app), Some(source.as_path()));

        f.service.set_default_source(&app, None).unwrap();
        assert_eq!(f.reload().default_source(&app), None);

        assert!(matches!(
            f.service.set_default_source(&app, Some(f.path("missing.wav"))),
            Err(ServiceError::PathMissing(_))
        ));
    }

    // ── replacements ──────────────────────────────────────────────────────────

    #[test]
    fn apply_and_revert_persist_every_step() {
        let mut f = fixture();
        let original = f.path("App/a.wav");
        let target = f.path("Desktop/b.wav");
        write(&original, b"original");
        write(&target, b"mine");

        let record = f.service.apply_replacement(&original, &target, &mut never).unwrap();
        assert_eq!(record.backup_path, f.path("App/a.wav.bak"));
        assert_eq!(f.reload().replacements.get(&original), Some(&record));

        assert_eq!(
            f.service.revert_replacement(&original).unwrap(),
            RevertOutcome::Restored
        );
        assert!(f.reload().replacements.is_empty());
        assert_eq!(fs::read(&original).unwrap(), b"original");
    }

    #[test]
    fn failed_apply_does_not_touch_config_file() {
        let mut f = fixture();
        let original = f.path("App/a.wav");
        write(&original, b"original");

        let err = f
            .service
            .apply_replacement(&original, &f.path("missing.wav"), &mut never)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Ledger(LedgerError::TargetMissing(_))));
        assert!(!f.service.config_path().exists());
    }

    #[test]
    fn apply_default_source_uses_app_default() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let original = app.join("Contents/Resources/a.wav");
        let source = f.path("Desktop/pop.wav");
        write(&original, b"original");
        write(&source, b"pop");
        f.service.add_app(&app).unwrap();

        assert!(matches!(
            f.service.apply_default_source(&app, &original, &mut never),
            Err(ServiceError::NoDefaultSource(_))
        ));

        f.service.set_default_source(&app, Some(source.clone())).unwrap();
        let record = f.service.apply_default_source(&app, &original, &mut never).unwrap();
        assert_eq!(record.target, source);
    }

    #[test]
    fn remove_app_reverts_only_nested_records() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let other = f.path("FooBar.app");
        let inside_a = app.join("Contents/Resources/a.wav");
        let inside_b = app.join("Contents/Resources/sub/b.wav");
        let outside = other.join("Contents/Resources/c.wav");
        let target = f.path("Desktop/t.wav");
        write(&inside_a, b"a");
        write(&inside_b, b"b");
        write(&outside, b"c");
        write(&target, b"t");

        f.service.add_app(&app).unwrap();
        f.service.add_app(&other).unwrap();
        f.service.set_default_source(&app, Some(target.clone())).unwrap();
        for original in [&inside_a, &inside_b, &outside] {
            f.service.apply_replacement(original, &target, &mut never).unwrap();
        }

        let summary = f.service.remove_app(&app).unwrap();
        assert_eq!(summary.reverted, 2);
        assert_eq!(summary.failed(), 0);
        assert!(summary.missing_backups.is_empty());

        assert_eq!(fs::read(&inside_a).unwrap(), b"a");
        assert_eq!(fs::read(&inside_b).unwrap(), b"b");
        assert!(fs::symlink_metadata(&outside).unwrap().file_type().is_symlink());

        let saved = f.reload();
        assert!(saved.app(&app).is_none());
        assert!(saved.app(&other).is_some());
        assert!(saved.default_source(&app).is_none());
        assert_eq!(saved.replacements.len(), 1);
        assert!(saved.replacements.get(&outside).is_some());
    }

    #[test]
    fn remove_app_collects_failures_and_still_removes() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let good = app.join("Contents/Resources/a.wav");
        let bad = app.join("Contents/Resources/b.wav");
        let gone = app.join("Contents/Resources/c.wav");
        let target = f.path("Desktop/t.wav");
        write(&good, b"a");
        write(&bad, b"b");
        write(&gone, b"c");
        write(&target, b"t");

        f.service.add_app(&app).unwrap();
        for original in [&good, &bad, &gone] {
            f.service.apply_replacement(original, &target, &mut never).unwrap();
        }
        // `bad`: backup lost and a real file put back in place.
        fs::remove_file(ledger_backup(&bad)).unwrap();
        fs::remove_file(&bad).unwrap();
        write(&bad, b"vendor update");
        // `gone`: backup lost, symlink still there.
        fs::remove_file(ledger_backup(&gone)).unwrap();

        let summary = f.service.remove_app(&app).unwrap();
        assert_eq!(summary.reverted, 2);
        assert_eq!(summary.missing_backups, vec![gone.clone()]);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.failures[0].0, bad);

        let saved = f.reload();
        assert!(saved.app(&app).is_none());
        // The failed record survives for a later manual revert.
        assert!(saved.replacements.get(&bad).is_some());
    }

    fn ledger_backup(original: &Path) -> PathBuf {
        crate::ledger::backup_path_for(original)
    }

    #[test]
    fn remove_unmonitored_app_fails() {
        let mut f = fixture();
        assert!(matches!(
            f.service.remove_app(&f.path("Foo.app")),
            Err(ServiceError::NotMonitored(_))
        ));
    }

    #[test]
    fn replacements_for_reports_relative_paths() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let original = app.join("Contents/Resources/a.wav");
        let target = f.path("Desktop/t.wav");
        write(&original, b"a");
        write(&target, b"t");
        f.service.apply_replacement(&original, &target, &mut never).unwrap();

        let active = f.service.replacements_for(&app);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].relative, PathBuf::from("Contents/Resources/a.wav"));
        assert_eq!(active[0].record.target, target);
        assert!(f.service.replacements_for(&f.path("Other.app")).is_empty());
    }

    #[test]
    fn candidates_carry_prefill_and_active_state() {
        let mut f = fixture();
        let app = f.path("Foo.app");
        let a = app.join("Contents/Resources/a.wav");
        let b = app.join("Contents/Resources/b.aiff");
        let source = f.path("Desktop/pop.wav");
        write(&a, b"a");
        write(&b, b"b");
        write(&source, b"pop");
        f.service.add_app(&app).unwrap();
        f.service.set_default_source(&app, Some(source.clone())).unwrap();
        f.service.apply_replacement(&a, &source, &mut never).unwrap();

        let candidates = f.service.candidates(&app, None).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].path, a);
        assert!(candidates[0].active.is_some());
        assert_eq!(candidates[1].path, b);
        assert!(candidates[1].active.is_none());
        assert!(candidates.iter().all(|c| c.prefill.as_deref() == Some(source.as_path())));
    }

    // ── observers ─────────────────────────────────────────────────────────────

    #[test]
    fn observers_see_each_committed_change() {
        let mut f = fixture();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        f.service.subscribe(move |change| sink.borrow_mut().push(change.clone()));

        let app = f.path("Foo.app");
        fs::create_dir_all(&app).unwrap();
        f.service.add_app(&app).unwrap();
        let _ = f.service.add_app(&app);
        f.service.remove_app(&app).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![Change::AppAdded(app.clone()), Change::AppRemoved(app.clone())]
        );
    }

    #[test]
    fn change_display_names_the_path() {
        let c = Change::ReplacementApplied(PathBuf::from("/App/a.wav"));
        assert_eq!(c.to_string(), "replaced /App/a.wav");
    }
}
