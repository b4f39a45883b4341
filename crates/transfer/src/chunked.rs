use sha2::{Digest, Sha256};

use crate::TransferError;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verifies `data` against a hex SHA-256 digest.
///
/// An empty `expected` means the sender did not ask for verification.
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<(), TransferError> {
    if expected.is_empty() {
        return Ok(());
    }
    if checksum_bytes(data).eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch)
    }
}
