use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`. Every checksum in the system is this
/// 64-character form.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
