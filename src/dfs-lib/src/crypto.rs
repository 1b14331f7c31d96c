use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use log::warn;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::{DfsError, DfsResult};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Fresh random AES-256 key as lowercase hex.
pub fn generate_key_hex() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// PBKDF2-HMAC-SHA256 key derivation for the key file, hex output.
pub fn derive_key_hex(password: &str, salt: &[u8]) -> String {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    hex::encode(key)
}

fn decode_key(key_hex: &str) -> DfsResult<[u8; KEY_SIZE]> {
    let bytes = hex::decode(key_hex)
        .map_err(|e| DfsError::InvalidArgument(format!("key is not valid hex: {}", e)))?;
    if bytes.len() != KEY_SIZE {
        return Err(DfsError::InvalidArgument(format!(
            "key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// AES-256-GCM encryption. Output layout: `IV(12) ‖ ciphertext ‖ tag(16)`.
pub fn encrypt(plaintext: &[u8], key_hex: &str) -> DfsResult<Vec<u8>> {
    let key = decode_key(key_hex)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| DfsError::Fatal("AES-GCM encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Inverse of [`encrypt`]. A wrong key or tampered bytes surface as
/// `IntegrityFailure` via the GCM tag.
pub fn decrypt(blob: &[u8], key_hex: &str) -> DfsResult<Vec<u8>> {
    let key = decode_key(key_hex)?;
    if blob.len() < IV_SIZE + TAG_SIZE {
        return Err(DfsError::IntegrityFailure(format!(
            "encrypted blob too short: {} bytes",
            blob.len()
        )));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let (iv, ciphertext) = blob.split_at(IV_SIZE);
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| DfsError::IntegrityFailure("GCM tag verification failed".to_string()))
}

/// In-process key store: `key_id -> hex key`. Optionally persisted as a JSON
/// blob encrypted under a password-derived key (`salt ‖ IV ‖ ct ‖ tag` on
/// disk).
pub struct KeyManager {
    keys: Mutex<HashMap<String, String>>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn store_key(&self, key_id: &str, key_hex: &str) {
        let mut keys = self.keys.lock().unwrap();
        keys.insert(key_id.to_string(), key_hex.to_string());
    }

    pub fn get_key(&self, key_id: &str) -> Option<String> {
        let keys = self.keys.lock().unwrap();
        keys.get(key_id).cloned()
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        let keys = self.keys.lock().unwrap();
        keys.contains_key(key_id)
    }

    pub fn key_count(&self) -> usize {
        let keys = self.keys.lock().unwrap();
        keys.len()
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>, password: &str) -> DfsResult<()> {
        let json = {
            let keys = self.keys.lock().unwrap();
            serde_json::to_vec(&*keys)
                .map_err(|e| DfsError::Fatal(format!("serialize key store: {}", e)))?
        };

        let salt = generate_salt();
        let derived = derive_key_hex(password, &salt);
        let blob = encrypt(&json, &derived)?;

        let mut out = Vec::with_capacity(SALT_SIZE + blob.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&blob);
        std::fs::write(path.as_ref(), out).map_err(|e| {
            warn!("key store write failed: {}", e);
            DfsError::Fatal(format!("write key file: {}", e))
        })
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>, password: &str) -> DfsResult<()> {
        let raw = std::fs::read(path.as_ref())?;
        if raw.len() < SALT_SIZE {
            return Err(DfsError::IntegrityFailure(
                "key file shorter than its salt".to_string(),
            ));
        }
        let (salt, blob) = raw.split_at(SALT_SIZE);
        let derived = derive_key_hex(password, salt);
        let json = decrypt(blob, &derived)?;
        let loaded: HashMap<String, String> = serde_json::from_slice(&json)
            .map_err(|e| DfsError::IntegrityFailure(format!("key file payload: {}", e)))?;

        let mut keys = self.keys.lock().unwrap();
        keys.extend(loaded);
        Ok(())
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = generate_key_hex();
        let plain = b"attack at dawn";
        let blob = encrypt(plain, &key).unwrap();
        assert_eq!(blob.len(), IV_SIZE + plain.len() + TAG_SIZE);
        assert_ne!(&blob[IV_SIZE..IV_SIZE + plain.len()], plain.as_slice());
        let round = decrypt(&blob, &key).unwrap();
        assert_eq!(round, plain);
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = generate_key_hex();
        let a = encrypt(b"same input", &key).unwrap();
        let b = encrypt(b"same input", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_tag_check() {
        let blob = encrypt(b"secret", &generate_key_hex()).unwrap();
        let err = decrypt(&blob, &generate_key_hex()).unwrap_err();
        assert!(matches!(err, DfsError::IntegrityFailure(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_key_hex();
        let mut blob = encrypt(b"secret", &key).unwrap();
        let idx = IV_SIZE + 1;
        blob[idx] ^= 0xFF;
        assert!(matches!(
            decrypt(&blob, &key),
            Err(DfsError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn short_blob_is_rejected() {
        let key = generate_key_hex();
        assert!(matches!(
            decrypt(&[0u8; IV_SIZE + TAG_SIZE - 1], &key),
            Err(DfsError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dat");

        let manager = KeyManager::new();
        let key = generate_key_hex();
        manager.store_key("file_1_key", &key);
        manager.save_to_file(&path, "correct horse").unwrap();

        let restored = KeyManager::new();
        restored.load_from_file(&path, "correct horse").unwrap();
        assert_eq!(restored.get_key("file_1_key").unwrap(), key);

        let wrong = KeyManager::new();
        assert!(matches!(
            wrong.load_from_file(&path, "battery staple"),
            Err(DfsError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        assert_eq!(derive_key_hex("pw", &salt), derive_key_hex("pw", &salt));
        assert_ne!(derive_key_hex("pw", &salt), derive_key_hex("pw2", &salt));
    }
}
