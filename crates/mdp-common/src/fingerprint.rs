//! Content fingerprints
//!
//! SHA-256 digests over JSON documents. Object keys are serialized in sorted
//! order, so two documents with the same content always hash identically
//! regardless of the order fields arrived in.

use crate::error::Result;
use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 of raw bytes
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the hex SHA-256 of a JSON value's canonical encoding
pub fn fingerprint_json(value: &serde_json::Value) -> Result<String> {
    let encoded = serde_json::to_vec(value)?;
    Ok(fingerprint_bytes(&encoded))
}

/// Short, log-friendly prefix of a fingerprint
pub fn short(fingerprint: &str) -> &str {
    let end = fingerprint.len().min(12);
    &fingerprint[..end]
}
