//! Snapkeep Agent Library
//!
//! Watches one file and keeps a retention-bounded archive of every real
//! change to it, with list, restore and delete over the archive.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod monitor;
pub mod store;
pub mod utils;
pub mod watcher;

// Re-export commonly used types
pub use config::{Config, DuplicatePolicy, MonitorConfig};
pub use monitor::events::MonitorEvent;
pub use monitor::{MonitorController, SessionState, SessionStatus};
pub use store::ledger::BackupRecord;
pub use store::{BackupStore, CaptureOutcome, LedgerRepair};
pub use utils::errors::{ErrorKind, SnapkeepError};
pub type Result<T> = std::result::Result<T, SnapkeepError>;
