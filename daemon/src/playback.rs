/// Fire-and-forget sound playback through an external player program.
///
/// Each sound gets its own detached thread that runs the player to completion.
/// Nothing comes back to the caller: failures are logged and forgotten.
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;

use crate::config::{MonitoredApp, Settings};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no sound is assigned")]
    NoSound,
    #[error("sound file not found: {}", .0.display())]
    SoundMissing(PathBuf),
    #[error("failed to spawn playback thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Builds the player invocation for `sound`.
pub fn player_command(settings: &Settings, sound: &Path) -> Command {
    let mut cmd = Command::new(&settings.player);
    cmd.args(&settings.player_args)
        .arg(sound)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Starts playing `sound` on a detached thread.
///
/// The returned handle may be dropped; it exists so callers that care (tests,
/// the preview command) can wait for the player to finish.
pub fn play_detached(settings: &Settings, sound: PathBuf) -> Result<JoinHandle<()>, PlaybackError> {
    let mut cmd = player_command(settings, &sound);
    let handle = std::thread::Builder::new()
        .name("chime-playback".into())
        .spawn(move || match cmd.status() {
            Ok(status) if status.success() => debug!("[playback] Played {}", sound.display()),
            Ok(status) => warn!("[playback] Player exited with {status} for {}", sound.display()),
            Err(e) => warn!("[playback] Could not run player for {}: {e}", sound.display()),
        })?;
    Ok(handle)
}

/// Plays the launch sound assigned to `app`, if it has one.
///
/// A missing file is only logged; the watcher must keep running.
pub fn play_launch_sound(settings: &Settings, app: &MonitoredApp) {
    let Some(sound) = app.sound.as_deref() else {
        debug!("[playback] {} has no launch sound", app.display_name());
        return;
    };
    let path = settings.resolve_sound(sound);
    if !path.exists() {
        warn!(
            "[playback] Launch sound for {} not found: {}",
            app.display_name(),
            path.display()
        );
        return;
    }
    if let Err(e) = play_detached(settings, path) {
        warn!("[playback] {e}");
    }
}

/// Checks that `sound` resolves to an existing file, then plays it.
pub fn preview(settings: &Settings, sound: &str) -> Result<JoinHandle<()>, PlaybackError> {
    if sound.trim().is_empty() {
        return Err(PlaybackError::NoSound);
    }
    let path = settings.resolve_sound(sound);
    if !path.exists() {
        return Err(PlaybackError::SoundMissing(path));
    }
    play_detached(settings, path)
}
