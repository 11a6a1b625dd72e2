mod config;
mod event;
mod ledger;
mod paths;
mod playback;
mod process_monitor;
mod scan;
mod service;
mod status;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::ledger::{OverwritePolicy, RevertOutcome};
use crate::service::ChimeService;

/// Plays a sound when chosen applications launch, and swaps sound files
/// inside applications for your own.
#[derive(Parser, Debug)]
#[command(name = "chime", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the platform default.
    #[arg(long, env = "CHIME_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch for launches of monitored applications and play their sounds.
    Watch,

    /// Start monitoring an application.
    Add { app: PathBuf },

    /// Stop monitoring an application and revert all of its replacements.
    Remove {
        app: PathBuf,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show monitored applications.
    List,

    /// Show the launch-sound library.
    Sounds,

    /// Assign (or clear) an application's launch sound.
    SetSound {
        app: PathBuf,
        /// File name in the sound library, or an absolute path.
        #[arg(required_unless_present = "clear")]
        sound: Option<String>,
        #[arg(long, conflicts_with = "sound")]
        clear: bool,
    },

    /// Set (or clear) the file used as the default replacement for an application.
    SetDefaultSource {
        app: PathBuf,
        #[arg(required_unless_present = "clear")]
        file: Option<PathBuf>,
        #[arg(long, conflicts_with = "file")]
        clear: bool,
    },

    /// List sound files inside an application that can be replaced.
    Candidates {
        app: PathBuf,
        /// Directory to scan, relative to the application (default: Contents/Resources).
        #[arg(long)]
        subdir: Option<PathBuf>,
    },

    /// Replace a sound file with a symlink to TARGET, backing up the original.
    Apply {
        original: PathBuf,
        /// Replacement file. Defaults to the owning application's default source.
        target: Option<PathBuf>,
        /// Application whose default source to use.
        #[arg(long)]
        app: Option<PathBuf>,
        /// Overwrite an existing backup without asking.
        #[arg(long, conflicts_with = "keep_backup")]
        overwrite_backup: bool,
        /// Abort instead of overwriting an existing backup.
        #[arg(long)]
        keep_backup: bool,
    },

    /// Undo a replacement and restore the original from its backup.
    Revert { original: PathBuf },

    /// Show active replacements, optionally only those inside APP.
    Replacements { app: Option<PathBuf> },

    /// Play a sound once.
    Preview {
        /// File name in the sound library, or a path.
        sound: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .map(|p| absolute_path(&p))
        .unwrap_or_else(paths::config_file_path);

    if let Commands::Watch = cli.command {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        return runtime.block_on(watch(config_path));
    }

    let mut service = ChimeService::load(config_path)?;
    service.subscribe(|change| info!("[chime] {change}"));

    match cli.command {
        Commands::Watch => unreachable!("handled above"),

        Commands::Add { app } => {
            let app = absolute_path(&app);
            let added = service.add_app(&app)?;
            match &added.sound {
                Some(sound) => println!("Monitoring {} (launch sound: {sound})", added.display_name()),
                None => println!("Monitoring {} (no launch sound yet)", added.display_name()),
            }
        }

        Commands::Remove { app, yes } => {
            let app = absolute_path(&app);
            ensure_monitored(&service, &app)?;
            let question = format!(
                "Stop monitoring {} and revert its sound replacements?",
                app.display()
            );
            if !yes && !ask(&question) {
                println!("Cancelled");
                return Ok(());
            }
            let summary = service.remove_app(&app)?;
            println!("Stopped monitoring {}", app.display());
            println!(
                "Reverted {} sound replacements. Failed to revert {}.",
                summary.reverted,
                summary.failed()
            );
            for original in &summary.missing_backups {
                println!("  warning: no backup for {}; original not restored", original.display());
            }
            for (original, e) in &summary.failures {
                println!("  failed: {}: {e}", original.display());
            }
        }

        Commands::List => {
            let config = service.config();
            println!("Config: {}", service.config_path().display());
            if config.applications.is_empty() {
                println!("No applications are monitored");
            }
            for app in &config.applications {
                println!("{}", app.path.display());
                println!("  launch sound:   {}", app.sound.as_deref().unwrap_or("(none)"));
                println!(
                    "  default source: {}",
                    config
                        .default_source(&app.path)
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "(none)".to_string())
                );
                println!("  replacements:   {}", service.replacements_for(&app.path).len());
            }
        }

        Commands::Sounds => {
            let dir = &service.settings().sounds_dir;
            let names = scan::list_library(dir)?;
            if names.is_empty() {
                println!("No .mp3 or .wav files in {}", dir.display());
            }
            for name in names {
                println!("{name}");
            }
        }

        Commands::SetSound { app, sound, clear } => {
            let app = absolute_path(&app);
            let sound = if clear { None } else { sound };
            service.set_sound(&app, sound.clone())?;
            match sound {
                Some(s) => println!("Launch sound for {} set to {s}", app.display()),
                None => println!("Launch sound for {} cleared", app.display()),
            }
        }

        Commands::SetDefaultSource { app, file, clear } => {
            let app = absolute_path(&app);
            let file = if clear { None } else { file.map(|f| absolute_path(&f)) };
            service.set_default_source(&app, file.clone())?;
            match file {
                Some(f) => println!("Default source for {} set to {}", app.display(), f.display()),
                None => println!("Default source for {} cleared", app.display()),
            }
        }

        Commands::Candidates { app, subdir } => {
            let app = absolute_path(&app);
            let candidates = service.candidates(&app, subdir.as_deref())?;
            if candidates.is_empty() {
                println!("No sound files found");
            }
            for c in candidates {
                let rel = c.path.strip_prefix(&app).unwrap_or(&c.path);
                match (&c.active, &c.prefill) {
                    (Some(record), _) => {
                        println!("{}  [replaced -> {}]", rel.display(), record.target.display())
                    }
                    (None, Some(prefill)) => println!("{}  -> {}", rel.display(), prefill.display()),
                    (None, None) => println!("{}", rel.display()),
                }
            }
        }

        Commands::Apply {
            original,
            target,
            app,
            overwrite_backup,
            keep_backup,
        } => {
            let original = absolute_path(&original);
            let mut policy = BackupPrompt {
                overwrite: overwrite_backup,
                keep: keep_backup,
            };
            let record = match target {
                Some(target) => {
                    service.apply_replacement(&original, &absolute_path(&target), &mut policy)?
                }
                None => {
                    let app = match app {
                        Some(app) => absolute_path(&app),
                        None => owning_app(&service, &original).ok_or_else(|| {
                            anyhow!(
                                "no TARGET given and {} is not inside a monitored application",
                                original.display()
                            )
                        })?,
                    };
                    service.apply_default_source(&app, &original, &mut policy)?
                }
            };
            println!(
                "Replaced {} with a link to {} (backup: {})",
                original.display(),
                record.target.display(),
                record.backup_path.display()
            );
        }

        Commands::Revert { original } => {
            let original = absolute_path(&original);
            match service.revert_replacement(&original)? {
                RevertOutcome::Restored => println!("Restored {}", original.display()),
                RevertOutcome::BackupMissing { backup } => println!(
                    "warning: backup {} not found; link removed but {} was not restored",
                    backup.display(),
                    original.display()
                ),
            }
        }

        Commands::Replacements { app } => {
            match app {
                Some(app) => {
                    let app = absolute_path(&app);
                    let active = service.replacements_for(&app);
                    if active.is_empty() {
                        println!("No active sound replacements for {}", app.display());
                    }
                    for r in active {
                        println!("{}  -> {}", r.relative.display(), r.record.target.display());
                        println!("  revert with: chime revert {}", r.original.display());
                    }
                }
                None => {
                    let ledger = &service.config().replacements;
                    if ledger.is_empty() {
                        println!("No active sound replacements");
                    }
                    for (original, record) in ledger.iter() {
                        println!("{}  -> {}", original.display(), record.target.display());
                    }
                    if !ledger.is_empty() {
                        println!("{} active sound replacements", ledger.len());
                    }
                }
            }
        }

        Commands::Preview { sound } => {
            let handle = playback::preview(service.settings(), &sound)?;
            if handle.join().is_err() {
                bail!("playback thread panicked");
            }
        }
    }

    Ok(())
}

/// Runs the launch watcher until Ctrl+C.
async fn watch(config_path: PathBuf) -> Result<()> {
    let mut current_status = status::DaemonStatus::new();
    let initial_config = match config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!("[config] {e:#} (using defaults)");
            current_status.record_error(format!("{e:#}"));
            config::Config::default()
        }
    };
    if let Err(e) = scan::list_library(&initial_config.settings.sounds_dir) {
        warn!("[scan] {e}");
    }

    let status_path = paths::status_file_path_for(&config_path);
    current_status.state = status::DaemonState::Watching;
    current_status.monitored_apps = initial_config.applications.len();
    status::write_status(&status_path, &current_status);

    let shared_config = Arc::new(RwLock::new(initial_config));
    let (event_tx, mut event_rx) = mpsc::channel::<event::DaemonEvent>(32);

    tokio::spawn(config::watch_config(config_path.clone(), event_tx.clone()));
    tokio::spawn(process_monitor::run(Arc::clone(&shared_config), event_tx.clone()));

    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(event::DaemonEvent::Shutdown).await;
            }
        });
    }

    info!(
        "chime v{} watching {} applications ({})",
        env!("CARGO_PKG_VERSION"),
        current_status.monitored_apps,
        config_path.display()
    );

    while let Some(evt) = event_rx.recv().await {
        match evt {
            event::DaemonEvent::AppLaunched(app) => {
                {
                    let cfg = shared_config.read().await;
                    playback::play_launch_sound(&cfg.settings, &app);
                }
                current_status.record_launch(&app.display_name());
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::ConfigReloaded(new_config) => {
                info!(
                    "[config] Reloaded ({} applications)",
                    new_config.applications.len()
                );
                current_status.monitored_apps = new_config.applications.len();
                current_status.error = None;
                *shared_config.write().await = new_config;
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::ConfigError(message) => {
                current_status.record_error(message);
                status::write_status(&status_path, &current_status);
            }

            event::DaemonEvent::Shutdown => {
                info!("Shutting down");
                current_status.state = status::DaemonState::Idle;
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }

    Ok(())
}

/// Makes `path` absolute without resolving a symlink in its last component,
/// so a replaced sound file is keyed by its own path, not its target's.
fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (joined.parent(), joined.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(joined),
        // Ends in `..` or a root: nothing to keep unresolved.
        _ => joined.canonicalize().unwrap_or(joined),
    }
}

/// Fails with `NotMonitored` before anything asks for confirmation.
fn ensure_monitored(service: &ChimeService, app: &Path) -> Result<()> {
    if service.config().app(app).is_none() {
        return Err(service::ServiceError::NotMonitored(app.to_path_buf()).into());
    }
    Ok(())
}

/// The monitored application whose directory contains `original`.
fn owning_app(service: &ChimeService, original: &Path) -> Option<PathBuf> {
    service
        .config()
        .applications
        .iter()
        .find(|a| original.starts_with(&a.path))
        .map(|a| a.path.clone())
}

/// Resolves backup conflicts from CLI flags, falling back to asking on stdin.
struct BackupPrompt {
    overwrite: bool,
    keep: bool,
}

impl OverwritePolicy for BackupPrompt {
    fn overwrite_backup(&mut self, backup: &Path) -> bool {
        if self.overwrite {
            return true;
        }
        if self.keep {
            return false;
        }
        ask(&format!("Backup {} already exists. Overwrite it?", backup.display()))
    }
}

/// Asks a yes/no question on stdin. Anything but "y"/"yes" means no.
fn ask(question: &str) -> bool {
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    is_yes(&answer)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn is_yes_accepts_only_affirmatives() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[test]
    fn backup_prompt_flags_decide_without_asking() {
        let backup = Path::new("/App/a.wav.bak");
        let mut overwrite = BackupPrompt {
            overwrite: true,
            keep: false,
        };
        let mut keep = BackupPrompt {
            overwrite: false,
            keep: true,
        };
        assert!(overwrite.overwrite_backup(backup));
        assert!(!keep.overwrite_backup(backup));
    }

    #[test]
    fn set_sound_requires_sound_or_clear() {
        assert!(Cli::try_parse_from(["chime", "set-sound", "/A.app"]).is_err());
        assert!(Cli::try_parse_from(["chime", "set-sound", "/A.app", "--clear"]).is_ok());
        assert!(Cli::try_parse_from(["chime", "set-sound", "/A.app", "x.wav"]).is_ok());
        assert!(Cli::try_parse_from(["chime", "set-sound", "/A.app", "x.wav", "--clear"]).is_err());
    }

    #[test]
    fn apply_backup_flags_conflict() {
        assert!(Cli::try_parse_from([
            "chime",
            "apply",
            "/A.app/a.wav",
            "/b.wav",
            "--overwrite-backup",
            "--keep-backup"
        ])
        .is_err());
    }

    #[test]
    fn absolute_path_keeps_final_symlink_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.wav");
        std::fs::write(&target, b"t").unwrap();
        let link = dir.path().join("a.wav");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let resolved = absolute_path(&link);
        assert_eq!(resolved.file_name().unwrap(), "a.wav");
        assert!(resolved.is_absolute());
    }

    #[test]
    fn absolute_path_resolves_trailing_parent_component() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let resolved = absolute_path(&dir.path().join("sub").join(".."));
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn ensure_monitored_rejects_unknown_app() {
        let mut cfg = config::Config::default();
        cfg.applications.push(config::MonitoredApp {
            path: PathBuf::from("/Applications/Foo.app"),
            sound: None,
        });
        let service = ChimeService::with_config(PathBuf::from("/tmp/unused.toml"), cfg);

        assert!(ensure_monitored(&service, Path::new("/Applications/Foo.app")).is_ok());
        let err = ensure_monitored(&service, Path::new("/Applications/Bar.app")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<service::ServiceError>(),
            Some(service::ServiceError::NotMonitored(_))
        ));
    }

    #[test]
    fn failed_reload_is_written_to_status_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let status_path = paths::status_file_path_for(&config_path);
        std::fs::write(&config_path, "[settings\npoll_interval_secs = ").unwrap();

        let mut current_status = status::DaemonStatus::new();
        let event::DaemonEvent::ConfigError(message) = config::reload_event(&config_path) else {
            panic!("expected ConfigError");
        };
        current_status.record_error(message);
        status::write_status(&status_path, &current_status);

        let content = std::fs::read_to_string(&status_path).unwrap();
        let parsed: status::DaemonStatus = toml::from_str(&content).unwrap();
        assert!(parsed.error.unwrap().contains("Failed to parse config file"));
    }

    #[test]
    fn owning_app_finds_containing_app() {
        let mut cfg = config::Config::default();
        cfg.applications.push(config::MonitoredApp {
            path: PathBuf::from("/Applications/Foo.app"),
            sound: None,
        });
        let service = ChimeService::with_config(PathBuf::from("/tmp/unused.toml"), cfg);
        assert_eq!(
            owning_app(&service, Path::new("/Applications/Foo.app/Contents/Resources/a.wav")),
            Some(PathBuf::from("/Applications/Foo.app"))
        );
        assert_eq!(owning_app(&service, Path::new("/Applications/FooBar.app/a.wav")), None);
    }
}
