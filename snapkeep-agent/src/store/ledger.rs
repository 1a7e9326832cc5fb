//! Ledger types for the backup archive.
//!
//! The ledger is serialized as `metadata.json` in the archive directory and is
//! the only authority on which archive files are live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File name of the ledger inside the archive directory.
pub const LEDGER_FILE_NAME: &str = "metadata.json";

/// Scratch file used while replacing the ledger.
pub const LEDGER_TEMP_FILE_NAME: &str = "metadata.json.tmp";

/// Prefix of a corrupt ledger moved aside during recovery.
pub const LEDGER_QUARANTINE_PREFIX: &str = "metadata.corrupt-";

/// One captured copy of the watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,

    #[serde(rename = "originalFileName")]
    pub original_file_name: String,

    #[serde(rename = "backupFileName")]
    pub archive_file_name: String,

    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "size")]
    pub size_bytes: u64,

    /// Hex SHA-256 of the archived bytes
    #[serde(rename = "hash")]
    pub content_digest: String,

    #[serde(rename = "originalPath")]
    pub source_path: PathBuf,

    /// Reference attached by a collaborator after capture (e.g. a screenshot)
    #[serde(rename = "screenshot", default)]
    pub supplementary_asset: Option<String>,
}

/// Whole-ledger document, read and written as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
}

impl Ledger {
    /// Most recently created record, if any.
    ///
    /// Equal timestamps resolve to the record appended last.
    pub fn newest(&self) -> Option<&BackupRecord> {
        self.backups
            .iter()
            .enumerate()
            .max_by_key(|(idx, r)| (r.created_at, *idx))
            .map(|(_, r)| r)
    }

    pub fn find(&self, id: &str) -> Option<&BackupRecord> {
        self.backups.iter().find(|r| r.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.backups.iter().position(|r| r.id == id)
    }

    /// Records ordered newest-first by capture time.
    pub fn newest_first(&self) -> Vec<BackupRecord> {
        let mut records: Vec<(usize, &BackupRecord)> = self.backups.iter().enumerate().collect();
        records.sort_by(|(ia, a), (ib, b)| (b.created_at, *ib).cmp(&(a.created_at, *ia)));
        records.into_iter().map(|(_, r)| r.clone()).collect()
    }
}
