//! Retention cleanup for cacheable artifact directories.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupRequest {
    pub retention_days: Option<u64>,
    pub directories: Option<Vec<String>>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub retention_days: u64,
    pub dry_run: bool,
    pub scanned_directories: Vec<String>,
    pub removed_files: u64,
    pub removed_dirs: u64,
    pub bytes_reclaimed: u64,
    /// Per-directory failures; accumulated, never fatal.
    pub errors: Vec<String>,
}

/// Remove files older than the retention window, then drop empty
/// subdirectories. The roots themselves are never removed. Errors are
/// collected per directory and reported in the summary.
pub fn run_cleanup(directories: &[String], retention_days: u64, dry_run: bool) -> CleanupSummary {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 86_400);
    let mut summary = CleanupSummary {
        retention_days,
        dry_run,
        scanned_directories: directories.to_vec(),
        removed_files: 0,
        removed_dirs: 0,
        bytes_reclaimed: 0,
        errors: Vec::new(),
    };

    for dir in directories {
        let root = Path::new(dir);
        if !root.is_dir() {
            summary.errors.push(format!("{dir}: not a directory"));
            continue;
        }
        if let Err(e) = sweep_dir(root, root, cutoff, dry_run, &mut summary) {
            summary.errors.push(format!("{dir}: {e}"));
        }
    }

    info!(
        removed_files = summary.removed_files,
        removed_dirs = summary.removed_dirs,
        bytes = summary.bytes_reclaimed,
        dry_run,
        "cleanup finished"
    );
    summary
}

fn sweep_dir(
    root: &Path,
    dir: &Path,
    cutoff: SystemTime,
    dry_run: bool,
    summary: &mut CleanupSummary,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            if let Err(e) = sweep_dir(root, &path, cutoff, dry_run, summary) {
                summary.errors.push(format!("{}: {e}", path.display()));
            }
            continue;
        }

        let modified = metadata.modified()?;
        if modified < cutoff {
            summary.removed_files += 1;
            summary.bytes_reclaimed += metadata.len();
            if !dry_run {
                std::fs::remove_file(&path)?;
            }
        }
    }

    // Drop the directory itself once emptied, but never a configured root.
    if dir != root {
        let is_empty = std::fs::read_dir(dir)?.next().is_none();
        if is_empty {
            summary.removed_dirs += 1;
            if !dry_run {
                std::fs::remove_dir(dir)?;
            }
        }
    }
    Ok(())
}
