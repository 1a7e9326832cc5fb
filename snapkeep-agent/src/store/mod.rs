//! Backup store: the archive directory plus its `metadata.json` ledger.
//!
//! Every ledger mutation is a read-modify-write of the whole document under
//! `ledger_lock`. Restore, delete and eviction also serialize on `restore_lock`
//! so a record cannot be deleted or evicted while it is being restored.

pub mod ledger;
pub mod retention;

use crate::config::DuplicatePolicy;
use crate::fs::{fingerprint, replace};
use crate::utils::errors::{Result, SnapkeepError};
use chrono::{DateTime, Utc};
use ledger::{
    BackupRecord, Ledger, LEDGER_FILE_NAME, LEDGER_QUARANTINE_PREFIX, LEDGER_TEMP_FILE_NAME,
};
use std::collections::HashSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Result of a capture attempt
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// A new live record was appended
    Created(BackupRecord),
    /// Content matched the newest record. Under [`DuplicatePolicy::Skip`] this
    /// carries that existing record; under [`DuplicatePolicy::Record`] it carries
    /// the appended record whose archive file was removed.
    Duplicate(BackupRecord),
    /// Source was zero bytes; nothing archived
    SkippedEmpty,
}

/// A damaged ledger was replaced by an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRepair {
    pub ledger_path: PathBuf,
    /// Where the damaged file was moved, when the move succeeded
    pub quarantined_to: Option<PathBuf>,
    pub reason: String,
}

impl From<LedgerRepair> for SnapkeepError {
    fn from(repair: LedgerRepair) -> Self {
        let reason = match &repair.quarantined_to {
            Some(path) => format!("{}; previous ledger kept at {}", repair.reason, path.display()),
            None => repair.reason,
        };
        SnapkeepError::LedgerCorrupt {
            path: repair.ledger_path,
            reason,
        }
    }
}

pub struct BackupStore {
    archive_dir: PathBuf,
    duplicate_policy: DuplicatePolicy,
    ledger_lock: Mutex<()>,
    restore_lock: Mutex<()>,
    repairs: broadcast::Sender<LedgerRepair>,
}

impl BackupStore {
    /// Open (and create if needed) the archive rooted at `archive_dir`
    pub async fn open(
        archive_dir: impl Into<PathBuf>,
        duplicate_policy: DuplicatePolicy,
    ) -> Result<Self> {
        let archive_dir = archive_dir.into();
        tokio::fs::create_dir_all(&archive_dir).await?;
        debug!("Opened archive at {}", archive_dir.display());

        let (repairs, _) = broadcast::channel(8);
        Ok(Self {
            archive_dir,
            duplicate_policy,
            ledger_lock: Mutex::new(()),
            restore_lock: Mutex::new(()),
            repairs,
        })
    }

    /// Notices of ledger corruption recovered from by any later operation
    pub fn subscribe_repairs(&self) -> broadcast::Receiver<LedgerRepair> {
        self.repairs.subscribe()
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.archive_dir.join(LEDGER_FILE_NAME)
    }

    /// Absolute path of the archive file backing `record`
    pub fn archive_file_path(&self, record: &BackupRecord) -> PathBuf {
        self.archive_dir.join(&record.archive_file_name)
    }

    /// Archive a copy of `source_path`.
    pub async fn create(&self, source_path: &Path) -> Result<CaptureOutcome> {
        let _guard = self.ledger_lock.lock().await;

        let metadata = match tokio::fs::metadata(source_path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(SnapkeepError::SourceMissing(source_path.to_path_buf())),
        };
        if metadata.len() == 0 {
            debug!("Skipping capture of empty file {}", source_path.display());
            return Ok(CaptureOutcome::SkippedEmpty);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let original_file_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        let archive_file_name = archive_file_name(&original_file_name, &created_at, &id);
        let archive_path = self.archive_dir.join(&archive_file_name);

        let size_bytes = tokio::fs::copy(source_path, &archive_path)
            .await
            .map_err(|source| SnapkeepError::CopyFailed {
                from: source_path.to_path_buf(),
                to: archive_path.clone(),
                source,
            })?;

        let content_digest = match fingerprint::digest(&archive_path).await {
            Ok(digest) => digest,
            Err(e) => {
                remove_archive_file(&archive_path).await;
                return Err(e);
            }
        };

        let record = BackupRecord {
            id,
            original_file_name,
            archive_file_name,
            created_at,
            size_bytes,
            content_digest,
            source_path: source_path.to_path_buf(),
            supplementary_asset: None,
        };

        let mut ledger = self.load_ledger().await;

        let newest = ledger
            .newest()
            .filter(|newest| newest.content_digest == record.content_digest)
            .cloned();
        if let Some(newest) = newest {
            remove_archive_file(&archive_path).await;
            return match self.duplicate_policy {
                DuplicatePolicy::Skip => {
                    debug!(record_id = %newest.id, "Capture identical to newest backup, skipped");
                    Ok(CaptureOutcome::Duplicate(newest))
                }
                DuplicatePolicy::Record => {
                    ledger.backups.push(record.clone());
                    self.save_ledger(&ledger).await?;
                    debug!(
                        record_id = %record.id,
                        "Duplicate capture recorded without archive file"
                    );
                    Ok(CaptureOutcome::Duplicate(record))
                }
            };
        }

        ledger.backups.push(record.clone());
        // A failed write leaves the copy as an inert orphan.
        self.save_ledger(&ledger).await?;

        info!(
            record_id = %record.id,
            size = record.size_bytes,
            "Created backup {}",
            record.archive_file_name
        );
        Ok(CaptureOutcome::Created(record))
    }

    /// All records, newest first
    pub async fn list(&self) -> Vec<BackupRecord> {
        let _guard = self.ledger_lock.lock().await;
        self.load_ledger().await.newest_first()
    }

    pub async fn get(&self, id: &str) -> Option<BackupRecord> {
        let _guard = self.ledger_lock.lock().await;
        self.load_ledger().await.find(id).cloned()
    }

    /// Drop everything past the newest `max_count` records. Returns the evicted records.
    pub async fn evict_overflow(&self, max_count: usize) -> Result<Vec<BackupRecord>> {
        let _restore = self.restore_lock.lock().await;
        let _guard = self.ledger_lock.lock().await;

        let mut ledger = self.load_ledger().await;
        if ledger.backups.len() <= max_count {
            return Ok(Vec::new());
        }

        let selection = retention::select(std::mem::take(&mut ledger.backups), max_count);
        for record in &selection.evict {
            let path = self.archive_file_path(record);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(record_id = %record.id, "Evicted {}", path.display()),
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    debug!(record_id = %record.id, "Evicted record had no archive file");
                }
                Err(e) => {
                    warn!(record_id = %record.id, "Failed to delete {}: {}", path.display(), e)
                }
            }
        }

        ledger.backups = selection.keep;
        self.save_ledger(&ledger).await?;

        info!(
            evicted = selection.evict.len(),
            retained = ledger.backups.len(),
            "Applied retention limit of {}",
            max_count
        );
        Ok(selection.evict)
    }

    /// Copy a backup over `target_path`, rolling back on failure.
    pub async fn restore(&self, id: &str, target_path: &Path) -> Result<BackupRecord> {
        let _restore = self.restore_lock.lock().await;

        let record = self
            .get(id)
            .await
            .ok_or_else(|| SnapkeepError::RecordNotFound(id.to_string()))?;
        let archive_path = self.archive_file_path(&record);
        if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            return Err(SnapkeepError::ArchiveMissing {
                id: record.id,
                path: archive_path,
            });
        }

        let target = target_path.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || {
            replace::replace_with_rollback(&archive_path, &target)
        })
        .await
        .map_err(|e| SnapkeepError::RollbackFailed {
            target: target_path.to_path_buf(),
            reason: format!("restore task aborted: {}", e),
        })??;

        info!(record_id = %record.id, bytes, "Restored backup to {}", target_path.display());
        Ok(record)
    }

    /// Remove a record and its archive file. Returns `false` for an unknown id.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let _restore = self.restore_lock.lock().await;
        let _guard = self.ledger_lock.lock().await;

        let mut ledger = self.load_ledger().await;
        let Some(position) = ledger.position(id) else {
            return Ok(false);
        };
        let record = ledger.backups.remove(position);

        let path = self.archive_file_path(&record);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!(record_id = %record.id, "Failed to delete {}: {}", path.display(), e),
        }

        self.save_ledger(&ledger).await?;
        info!(record_id = %record.id, "Deleted backup");
        Ok(true)
    }

    /// Link an external asset to a record. Best-effort: failures return `false`.
    pub async fn attach_supplementary_asset(&self, id: &str, asset_ref: &str) -> bool {
        let _guard = self.ledger_lock.lock().await;

        let mut ledger = self.load_ledger().await;
        let Some(position) = ledger.position(id) else {
            return false;
        };
        let record = &mut ledger.backups[position];
        if record.supplementary_asset.as_deref() == Some(asset_ref) {
            return true;
        }
        record.supplementary_asset = Some(asset_ref.to_string());

        match self.save_ledger(&ledger).await {
            Ok(()) => true,
            Err(e) => {
                debug!(record_id = %id, "Asset attachment dropped: {}", e);
                false
            }
        }
    }

    /// Delete archive files no record references. Returns how many were removed.
    pub async fn collect_orphans(&self) -> Result<usize> {
        let _guard = self.ledger_lock.lock().await;

        let ledger = self.load_ledger().await;
        let live: HashSet<&str> = ledger
            .backups
            .iter()
            .map(|r| r.archive_file_name.as_str())
            .collect();

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.archive_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_ledger_file(&name) || live.contains(name.as_str()) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!("Removed orphan {}", name);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan {}: {}", name, e),
            }
        }

        if removed > 0 {
            info!(removed, "Collected orphaned archive files");
        }
        Ok(removed)
    }

    /// Read the ledger. Missing means empty; unreadable or unparseable is
    /// replaced by an empty ledger and the bad file is moved aside.
    async fn load_ledger(&self) -> Ledger {
        let path = self.ledger_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ledger::default(),
            Err(e) => {
                warn!("Ledger {} unreadable, using empty ledger: {}", path.display(), e);
                self.report_repair(LedgerRepair {
                    ledger_path: path,
                    quarantined_to: None,
                    reason: e.to_string(),
                });
                return Ledger::default();
            }
        };

        match serde_json::from_str::<Ledger>(&content) {
            Ok(ledger) => ledger,
            Err(e) => {
                let quarantine = self.archive_dir.join(format!(
                    "{}{}.json",
                    LEDGER_QUARANTINE_PREFIX,
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                warn!(
                    "Ledger {} is corrupt ({}), moving it to {} and starting empty",
                    path.display(),
                    e,
                    quarantine.display()
                );
                let quarantined_to = match tokio::fs::rename(&path, &quarantine).await {
                    Ok(()) => Some(quarantine),
                    Err(e) => {
                        warn!("Failed to quarantine corrupt ledger: {}", e);
                        None
                    }
                };
                self.report_repair(LedgerRepair {
                    ledger_path: path,
                    quarantined_to,
                    reason: e.to_string(),
                });
                Ledger::default()
            }
        }
    }

    fn report_repair(&self, repair: LedgerRepair) {
        // Having no subscribers is not an error
        let _ = self.repairs.send(repair);
    }

    /// Replace the ledger atomically: write a temp file, sync, rename.
    async fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        let path = self.ledger_path();
        let temp_path = self.archive_dir.join(LEDGER_TEMP_FILE_NAME);
        let write_err = |reason: String| SnapkeepError::LedgerWriteFailed {
            path: path.clone(),
            reason,
        };

        let json = serde_json::to_vec_pretty(ledger).map_err(|e| write_err(e.to_string()))?;

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        file.write_all(&json).await.map_err(|e| write_err(e.to_string()))?;
        file.sync_all().await.map_err(|e| write_err(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        Ok(())
    }
}

/// `<stem>_<YYYYMMDD_HHMMSS_mmm>_<id prefix><.ext>`
fn archive_file_name(original: &str, created_at: &DateTime<Utc>, id: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original.to_string());
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let short_id: String = id.chars().filter(|c| *c != '-').take(8).collect();

    format!(
        "{}_{}_{}{}",
        stem,
        created_at.format("%Y%m%d_%H%M%S_%3f"),
        short_id,
        extension
    )
}

/// The ledger, its scratch file and quarantined copies are never orphans.
fn is_ledger_file(name: &str) -> bool {
    name == LEDGER_FILE_NAME
        || name == LEDGER_TEMP_FILE_NAME
        || name.starts_with(LEDGER_QUARANTINE_PREFIX)
}

async fn remove_archive_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != IoErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
