//! Canonical encoding of ledger records
//!
//! Records are stored as compact JSON in the wire shape. The encoding is
//! deterministic: struct fields are written in declaration order and every
//! mapping inside a `Value` is key-ordered, so a record always encodes to
//! the same bytes. The content hash relies on this.

use crate::{types::AuditEvent, Error, Result};
use sha2::{Digest, Sha256};

/// Encode a record to its persisted bytes
pub fn encode(event: &AuditEvent) -> Result<Vec<u8>> {
    serde_json::to_vec(event)
        .map_err(|e| Error::InvalidPayload(format!("record does not encode: {}", e)))
}

/// Decode persisted bytes
pub fn decode(bytes: &[u8]) -> Result<AuditEvent> {
    serde_json::from_slice(bytes).map_err(|e| Error::Corrupted(e.to_string()))
}

/// SHA-256 of raw record bytes, hex
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical encoding, hex
pub fn content_hash(event: &AuditEvent) -> Result<String> {
    Ok(hash_bytes(&encode(event)?))
}

/// SHA-256 over a sequence of hex record hashes, in order, hex
pub fn combined_hash<'a>(hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}
