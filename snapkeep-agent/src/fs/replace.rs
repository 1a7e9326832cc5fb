//! Replace a caller-visible file with an archived copy, all or nothing.
//!
//! If the target exists it is first copied aside to a hidden sibling. Should
//! the main copy fail part-way, the sibling is moved back over the target, so
//! the target ends either fully replaced or exactly as it was.

use crate::utils::errors::{Result, SnapkeepError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Copy `source` over `target` with rollback. Returns bytes written.
///
/// Blocking; run it under `spawn_blocking` from async code.
pub fn replace_with_rollback(source: &Path, target: &Path) -> Result<u64> {
    replace_with_rollback_using(source, target, |from, to| fs::copy(from, to))
}

/// Same as [`replace_with_rollback`] with a pluggable copy routine for the
/// main transfer.
pub(crate) fn replace_with_rollback_using<F>(source: &Path, target: &Path, copy: F) -> Result<u64>
where
    F: Fn(&Path, &Path) -> io::Result<u64>,
{
    if !target.exists() {
        return copy_fresh(source, target, copy);
    }

    let aside = aside_path(target);
    fs::copy(target, &aside).map_err(|e| SnapkeepError::RestoreFailed {
        target: target.to_path_buf(),
        reason: format!("could not set current file aside: {}", e),
    })?;
    debug!("Set {} aside as {}", target.display(), aside.display());

    match copy(source, target) {
        Ok(bytes) => {
            if let Err(e) = fs::remove_file(&aside) {
                warn!("Failed to remove restore temp file {}: {}", aside.display(), e);
            }
            Ok(bytes)
        }
        Err(copy_err) => match roll_back(&aside, target) {
            Ok(()) => Err(SnapkeepError::RestoreFailed {
                target: target.to_path_buf(),
                reason: copy_err.to_string(),
            }),
            Err(rollback_err) => Err(SnapkeepError::RollbackFailed {
                target: target.to_path_buf(),
                reason: format!(
                    "copy failed ({}), rollback from {} failed ({})",
                    copy_err,
                    aside.display(),
                    rollback_err
                ),
            }),
        },
    }
}

fn copy_fresh<F>(source: &Path, target: &Path, copy: F) -> Result<u64>
where
    F: Fn(&Path, &Path) -> io::Result<u64>,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| SnapkeepError::RestoreFailed {
            target: target.to_path_buf(),
            reason: format!("could not create {}: {}", parent.display(), e),
        })?;
    }

    copy(source, target).map_err(|e| {
        // Nothing existed before, so a partial file is worse than none.
        let _ = fs::remove_file(target);
        SnapkeepError::RestoreFailed {
            target: target.to_path_buf(),
            reason: e.to_string(),
        }
    })
}

fn roll_back(aside: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(aside, target).is_ok() {
        return Ok(());
    }
    fs::copy(aside, target)?;
    fs::remove_file(aside)
}

fn aside_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restore".to_string());
    target.with_file_name(format!(".{}.snapkeep-{}.bak", name, uuid::Uuid::new_v4().simple()))
}
