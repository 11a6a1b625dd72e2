/// Symlink-based replacement of application sound files.
///
/// Applying a replacement moves the original file aside to `<original>.bak` and
/// puts a symlink to the user's file in its place. Reverting removes the
/// symlink and moves the backup back. Every active replacement has exactly one
/// [`ReplacementRecord`], keyed by the original file's path.
///
/// The on-disk steps are not transactional: a crash between "remove symlink"
/// and "restore backup" leaves the original absent with an orphaned backup and
/// a stale record. Nothing heals that automatically.
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Appended to the original path to form the backup path.
pub const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("target file does not exist: {}", .0.display())]
    TargetMissing(PathBuf),
    #[error("backup {} already exists and was not overwritten", .0.display())]
    BackupConflict(PathBuf),
    #[error("no replacement is recorded for {}", .0.display())]
    NotRecorded(PathBuf),
    #[error(
        "backup {} is missing and {} is not a replacement symlink; the original cannot be restored",
        .backup.display(),
        .original.display()
    )]
    Unrestorable { original: PathBuf, backup: PathBuf },
    #[error("failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LedgerError {
    fn io(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { op, path, source }
    }
}

/// Where the original file went and what the symlink points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRecord {
    pub backup_path: PathBuf,
    pub target: PathBuf,
}

/// Result of a successful [`ReplacementLedger::revert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    /// The backup was moved back over the original path.
    Restored,
    /// The symlink is gone but there was no backup to restore. The record is
    /// dropped anyway; the original path is now empty.
    BackupMissing { backup: PathBuf },
}

/// Decides whether an existing backup may be overwritten during apply.
pub trait OverwritePolicy {
    fn overwrite_backup(&mut self, backup: &Path) -> bool;
}

impl<F> OverwritePolicy for F
where
    F: FnMut(&Path) -> bool,
{
    fn overwrite_backup(&mut self, backup: &Path) -> bool {
        self(backup)
    }
}

/// All active replacements, keyed by original path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplacementLedger {
    records: BTreeMap<PathBuf, ReplacementRecord>,
}

impl ReplacementLedger {
    pub fn get(&self, original: &Path) -> Option<&ReplacementRecord> {
        self.records.get(original)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &ReplacementRecord)> {
        self.records.iter()
    }

    /// Records whose original path is nested under `dir`. Matching is by path
    /// component, so `/Apps/Foo` does not claim `/Apps/FooBar/x.wav`.
    pub fn records_under<'a>(
        &'a self,
        dir: &'a Path,
    ) -> impl Iterator<Item = (&'a PathBuf, &'a ReplacementRecord)> + 'a {
        self.records
            .iter()
            .filter(move |(original, _)| original.starts_with(dir) && original.as_path() != dir)
    }

    /// Replaces `original` with a symlink to `target`, backing up whatever
    /// regular file was there.
    ///
    /// An existing symlink at `original` is simply swapped out, so applying
    /// twice replaces rather than fails. If `<original>.bak` already exists and
    /// `original` is a real file, `policy` decides whether the old backup is
    /// discarded; declining returns [`LedgerError::BackupConflict`] with
    /// nothing touched.
    ///
    /// The ledger only changes once every filesystem step has succeeded.
    pub fn apply(
        &mut self,
        original: &Path,
        target: &Path,
        policy: &mut dyn OverwritePolicy,
    ) -> Result<ReplacementRecord, LedgerError> {
        if !target.exists() {
            return Err(LedgerError::TargetMissing(target.to_path_buf()));
        }

        let backup_path = backup_path_for(original);

        if is_symlink(original) {
            fs::remove_file(original).map_err(LedgerError::io("remove symlink", original))?;
            info!("[ledger] Removed existing symlink at {}", original.display());
        } else if occupied(original) {
            if occupied(&backup_path) {
                if !policy.overwrite_backup(&backup_path) {
                    return Err(LedgerError::BackupConflict(backup_path));
                }
                fs::remove_file(&backup_path)
                    .map_err(LedgerError::io("remove old backup", &backup_path))?;
                info!("[ledger] Removed old backup {}", backup_path.display());
            }
            fs::rename(original, &backup_path).map_err(LedgerError::io("back up", original))?;
            info!(
                "[ledger] Backed up {} to {}",
                original.display(),
                backup_path.display()
            );
        } else {
            debug!("[ledger] Nothing at {}; no backup taken", original.display());
        }

        create_symlink(target, original).map_err(LedgerError::io("create symlink at", original))?;
        info!(
            "[ledger] Linked {} -> {}",
            original.display(),
            target.display()
        );

        let record = ReplacementRecord {
            backup_path,
            target: target.to_path_buf(),
        };
        self.records.insert(original.to_path_buf(), record.clone());
        Ok(record)
    }

    /// Undoes the replacement recorded for `original`.
    ///
    /// The record is dropped when the backup was restored, or when there was no
    /// backup but the original path is now empty. If the backup is missing and
    /// something other than our symlink still sits at `original`, the record is
    /// kept and [`LedgerError::Unrestorable`] is returned.
    pub fn revert(&mut self, original: &Path) -> Result<RevertOutcome, LedgerError> {
        let record = self
            .records
            .get(original)
            .cloned()
            .ok_or_else(|| LedgerError::NotRecorded(original.to_path_buf()))?;

        if is_symlink(original) {
            fs::remove_file(original).map_err(LedgerError::io("remove symlink", original))?;
            info!("[ledger] Removed symlink {}", original.display());
        } else if occupied(original) {
            debug!(
                "[ledger] {} exists but is not a symlink; restoring over it",
                original.display()
            );
        } else {
            debug!("[ledger] No symlink left at {}", original.display());
        }

        if occupied(&record.backup_path) {
            fs::rename(&record.backup_path, original)
                .map_err(LedgerError::io("restore backup to", original))?;
            info!(
                "[ledger] Restored {} from {}",
                original.display(),
                record.backup_path.display()
            );
            self.records.remove(original);
            return Ok(RevertOutcome::Restored);
        }

        if occupied(original) {
            return Err(LedgerError::Unrestorable {
                original: original.to_path_buf(),
                backup: record.backup_path,
            });
        }

        warn!(
            "[ledger] Backup {} not found; {} removed but not restored",
            record.backup_path.display(),
            original.display()
        );
        self.records.remove(original);
        Ok(RevertOutcome::BackupMissing {
            backup: record.backup_path,
        })
    }
}

/// `<original>.bak`, keeping the original extension intact.
pub fn backup_path_for(original: &Path) -> PathBuf {
    let mut raw = original.as_os_str().to_os_string();
    raw.push(BACKUP_SUFFIX);
    PathBuf::from(raw)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// True if anything, including a dangling symlink, exists at `path`.
fn occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
