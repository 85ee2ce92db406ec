use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Resolve the directory for `ephemera.redb`.
///
/// Priority:
/// 1. `explicit` (`--storage-path` / `STORAGE_PATH`)
/// 2. Platform-specific app data dir (`~/.local/share/ephemera/`, etc.)
///
/// The directory itself is created by the durable backend, owner-only.
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_owned());
    }

    let dirs = ProjectDirs::from("", "", "ephemera")
        .context("could not determine platform data directory")?;
    Ok(dirs.data_dir().to_owned())
}
