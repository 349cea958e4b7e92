//! Compilation cache housekeeping.
//!
//! The engine keeps one subdirectory per engine build under its cache root.
//! After an engine upgrade the old subdirectories are dead weight; this
//! module removes every one of them except the directory of the loaded
//! build.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use tally_runtime_common::{CacheError, CacheInfo, RuntimeError};
use tally_runtime_ffi::Engine;

/// What an invalidation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Version directories that were deleted.
    pub removed: Vec<PathBuf>,
    /// Entries that were not directories and were left alone.
    pub skipped: Vec<PathBuf>,
    /// The current version directory, if present.
    pub kept: Option<PathBuf>,
}

/// Queries the engine for its cache layout and prunes stale versions.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    engine: Arc<Engine>,
}

impl CacheInvalidator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Ask the engine where the cache under `cache_root` lives and which
    /// version it currently writes.
    ///
    /// # Errors
    ///
    /// Fails if `cache_root` cannot be passed across the boundary.
    pub fn info(&self, cache_root: &Path) -> Result<CacheInfo, RuntimeError> {
        let info = self.engine.cache_info(cache_root)?;
        debug!(
            root = %info.root_path.display(),
            version = %info.current_version,
            "Cache info retrieved"
        );
        Ok(info)
    }

    /// Query the cache layout and remove every stale version directory.
    ///
    /// # Errors
    ///
    /// Fails if the cache root cannot be encoded, listed, or a stale
    /// directory cannot be removed.
    pub fn invalidate(&self, cache_root: &Path) -> Result<InvalidationReport, RuntimeError> {
        let info = self.info(cache_root)?;
        Ok(invalidate(&info)?)
    }
}

/// Remove every directory under `info.root_path` except the one named
/// `info.current_version`.
///
/// Entries that are not directories, symlinks included, are logged and
/// skipped.
///
/// # Errors
///
/// Returns the first filesystem error encountered. Directories removed
/// before the error stay removed. An empty `current_version` is rejected
/// before anything is listed.
#[instrument(skip_all, fields(root = %info.root_path.display(), version = %info.current_version))]
pub fn invalidate(info: &CacheInfo) -> Result<InvalidationReport, CacheError> {
    info!("Invalidating stale cache versions");

    let root = &info.root_path;
    if info.current_version.trim().is_empty() {
        return Err(CacheError::empty_version(root));
    }

    let current = OsStr::new(&info.current_version);
    let mut report = InvalidationReport::default();

    let entries = fs::read_dir(root).map_err(|e| CacheError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(root, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| CacheError::io(&path, e))?;

        if !file_type.is_dir() {
            warn!(path = %path.display(), "Skipping non-directory entry in cache root");
            report.skipped.push(path);
            continue;
        }

        if entry.file_name().as_os_str() == current {
            report.kept = Some(path);
            continue;
        }

        fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
        debug!(path = %path.display(), "Removed stale cache version");
        report.removed.push(path);
    }

    info!(
        removed = report.removed.len(),
        skipped = report.skipped.len(),
        "Cache invalidation complete"
    );
    Ok(report)
}
