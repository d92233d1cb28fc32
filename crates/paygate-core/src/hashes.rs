//! SHA-256 payment-hash helpers.
//!
//! A Lightning payment hash is `SHA-256(preimage)`; possession of the
//! preimage proves payment. Escrow release bookkeeping and streaming proof
//! verification both rely on this relation, so it lives in one place.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// The payment hash published in an invoice whose preimage is `preimage`.
pub fn payment_hash(preimage: &[u8; 32]) -> [u8; 32] {
    sha256(preimage)
}

/// Does `preimage` prove payment of the invoice carrying `hash`?
pub fn proves_payment(preimage: &[u8; 32], hash: &[u8; 32]) -> bool {
    payment_hash(preimage) == *hash
}

/// Generate a fresh random 32-byte preimage.
pub fn random_preimage() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

/// Parse a 64-character hex string into a 32-byte hash/preimage.
pub fn parse_hash32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}
