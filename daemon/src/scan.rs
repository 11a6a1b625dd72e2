use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions accepted in the launch-sound library.
pub const LIBRARY_EXTENSIONS: &[&str] = &["mp3", "wav"];
/// Extensions considered replaceable inside an application.
pub const CANDIDATE_EXTENSIONS: &[&str] = &["wav", "mp3", "aiff", "m4a"];
/// Where macOS bundles keep their resources, relative to the bundle root.
pub const DEFAULT_SCAN_SUBDIR: &str = "Contents/Resources";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan directory not found: {}", .0.display())]
    ScanDirMissing(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Lists the sound file names directly inside `dir`, sorted.
///
/// The directory is created if it does not exist yet, in which case the list
/// is empty.
pub fn list_library(dir: &Path) -> Result<Vec<String>, ScanError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|source| ScanError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        info!("[scan] Created sound library at {}", dir.display());
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|source| ScanError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && has_extension(&path, LIBRARY_EXTENSIONS) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Recursively finds replaceable sounds under `app/<subdir>`, defaulting to
/// `Contents/Resources`. Results are sorted.
pub fn scan_candidates(app: &Path, subdir: Option<&Path>) -> Result<Vec<PathBuf>, ScanError> {
    let root = app.join(subdir.unwrap_or_else(|| Path::new(DEFAULT_SCAN_SUBDIR)));
    if !root.is_dir() {
        return Err(ScanError::ScanDirMissing(root));
    }

    let mut found = Vec::new();
    walk(&root, &mut found)?;
    found.sort();
    debug!("[scan] {} candidates under {}", found.len(), root.display());
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), ScanError> {
    let entries = fs::read_dir(dir).map_err(|source| ScanError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| ScanError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        // file_type() does not follow symlinks, so linked directories are not
        // descended into while our own replacement symlinks are still listed.
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(&path, found)?;
        } else if has_extension(&path, CANDIDATE_EXTENSIONS) {
            found.push(path);
        }
    }
    Ok(())
}
