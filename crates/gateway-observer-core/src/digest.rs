use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canon;
use crate::error::ObserverError;

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `sha256:<lowercase-hex>` label over raw bytes. Used for equality only,
/// never compared for authority.
#[must_use]
pub fn digest_label(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

/// Digest label over the canonical encoding of a payload.
///
/// # Errors
/// Returns [`ObserverError::Canonicalization`] when the payload cannot be
/// canonically encoded.
pub fn payload_digest(payload: &Value) -> Result<String, ObserverError> {
    Ok(digest_label(&canon::canonical_bytes(payload)?))
}
