//! Streaming content fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 of a file's bytes. Files are read
//! in fixed-size chunks so large snapshots never need to fit in memory.

use crate::utils::errors::{Result, SnapkeepError};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read buffer size (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the fingerprint of the file at `path`.
///
/// Any open or read failure aborts with [`SnapkeepError::Read`]; a digest is
/// only produced once the whole stream has been consumed.
pub async fn digest(path: &Path) -> Result<String> {
    let read_err = |source| SnapkeepError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await.map_err(read_err)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint an in-memory buffer, matching [`digest`] for the same bytes.
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
