//! Integrity digests over canonical checkpoint content.
//!
//! SHA-256 over the canonical encoding, rendered as lowercase hex. The store
//! computes it at save time; resume recomputes it and refuses on mismatch.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::Event;
use crate::error::{CheckpointError, Result};

use super::canonical;

/// Length of a hex digest (256 bits)
pub const DIGEST_HEX_LEN: usize = 64;

/// Digest of arbitrary bytes
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a checkpoint's canonical `(payload, events)` encoding
pub fn checkpoint_hash(payload: &Value, events: &[Event]) -> Result<String> {
    let bytes = canonical::encode(payload, events)?;
    Ok(compute_hash(&bytes))
}

/// Compare a stored digest with a recomputed one.
///
/// Runs in time independent of where the digests first differ.
pub fn verify(stored: &str, recomputed: &str) -> bool {
    let a = stored.as_bytes();
    let b = recomputed.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Recompute the digest for loaded content and fail if it differs
pub fn ensure_valid(
    run_id: &str,
    stored: &str,
    payload: &Value,
    events: &[Event],
) -> Result<()> {
    let recomputed = checkpoint_hash(payload, events)?;
    if verify(stored, &recomputed) {
        Ok(())
    } else {
        Err(CheckpointError::IntegrityMismatch {
            run_id: run_id.to_string(),
            stored: stored.to_string(),
            recomputed,
        })
    }
}
