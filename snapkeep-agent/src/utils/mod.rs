//! Utility modules for the snapkeep agent.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ErrorKind, Result, SnapkeepError};
