//! Filesystem primitives: content fingerprints and rollback-safe replacement.

pub mod fingerprint;
pub mod replace;
