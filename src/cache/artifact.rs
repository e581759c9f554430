// src/cache/artifact.rs

//! Output artifact housekeeping.
//!
//! An artifact can still be held open by a previous instance that is shutting
//! down. Such a file cannot be removed, but it can be renamed aside; the
//! leftovers are swept later.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::fs::FileSystem;

const STALE_MARKER: &str = ".stale-";

/// Make `path` free for a fresh artifact.
///
/// Removes an existing file; if that fails, renames it to
/// `<name>.stale-<nanos>`. A failed rename is the only error.
pub fn prepare_output(fs: &dyn FileSystem, path: &Path) -> Result<()> {
    if !fs.is_file(path) {
        return Ok(());
    }

    match fs.remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed previous artifact");
            Ok(())
        }
        Err(err) => {
            let aside = stale_name(path);
            debug!(
                path = %path.display(),
                error = %err,
                "previous artifact is locked; renaming it aside"
            );
            fs.rename(path, &aside).with_context(|| {
                format!(
                    "artifact {} is locked and could not be renamed aside",
                    path.display()
                )
            })
        }
    }
}

/// Delete renamed-aside artifacts in `dir`. Best effort; returns how many
/// were removed.
pub fn sweep_stale(fs: &dyn FileSystem, dir: &Path) -> usize {
    let entries = match fs.read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.iter().filter(|p| is_stale_name(p)) {
        match fs.remove_file(entry) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %entry.display(), error = %err, "stale artifact still locked"),
        }
    }

    if removed > 0 {
        debug!(dir = %dir.display(), removed, "swept stale artifacts");
    }
    removed
}

fn stale_name(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{STALE_MARKER}{nanos}"));
    path.with_file_name(name)
}

fn is_stale_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(STALE_MARKER))
}
