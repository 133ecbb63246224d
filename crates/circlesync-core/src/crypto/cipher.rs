//! Symmetric ciphers for circle and per-peer keys
//!
//! Two wire variants are supported:
//!
//! | Variant | Layout |
//! |---------|--------|
//! | ChaCha20-Poly1305 (AEAD) | `[nonce (12)] + [ciphertext + tag (16)]` |
//! | AES-256-CBC (legacy) | `[iv (16)] + [ciphertext, PKCS7 padded]` |
//!
//! Neither layout carries a variant tag. Readers that do not know which key
//! (or which variant) produced a blob go through trial decryption instead.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, random_bytes32, Timestamp};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for ChaCha20-Poly1305 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// IV size for AES-256-CBC (one block, 16 bytes)
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Which symmetric construction a key is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CipherKind {
    /// ChaCha20-Poly1305 AEAD
    #[default]
    ChaCha20Poly1305,
    /// AES-256-CBC with PKCS7 padding, no authentication
    LegacyAesCbc,
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherKind::ChaCha20Poly1305 => write!(f, "chacha20poly1305"),
            CipherKind::LegacyAesCbc => write!(f, "aes-256-cbc"),
        }
    }
}

/// A 32-byte symmetric key tagged with its cipher and generation.
///
/// Circle keys carry a generation that increases with every rotation.
/// Derived per-peer keys always have generation 0.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey {
    /// Cipher this key is used with
    pub kind: CipherKind,
    /// Rotation counter within the key's scope
    pub generation: u32,
    /// Raw key material
    pub bytes: [u8; 32],
    /// When the key was created (ms)
    pub created_at: Timestamp,
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl SymmetricKey {
    /// Generate a new random key.
    ///
    /// Uses the system's cryptographically secure random number generator.
    pub fn generate(kind: CipherKind, generation: u32) -> Self {
        Self::from_bytes(kind, generation, random_bytes32())
    }

    /// Wrap existing key material
    pub fn from_bytes(kind: CipherKind, generation: u32, bytes: [u8; 32]) -> Self {
        Self {
            kind,
            generation,
            bytes,
            created_at: now_millis(),
        }
    }

    /// Short non-secret identifier of the key material, for logs
    pub fn fingerprint(&self) -> String {
        let digest = blake3::derive_key("circlesync key fingerprint v1", &self.bytes);
        hex::encode(&digest[..4])
    }

    /// Encrypt with this key's cipher.
    ///
    /// A fresh random nonce/IV is drawn for every call, so the same plaintext
    /// produces different ciphertext (and a different content hash) each time.
    pub fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        match self.kind {
            CipherKind::ChaCha20Poly1305 => encrypt_chacha(&self.bytes, plaintext),
            CipherKind::LegacyAesCbc => encrypt_aes_cbc(&self.bytes, plaintext),
        }
    }

    /// Decrypt with this key's cipher.
    ///
    /// Fails on wrong key, tampered data, or malformed input. CBC has no
    /// authentication, so a wrong key only fails when the padding check does;
    /// callers must validate the plaintext.
    pub fn decrypt(&self, ciphertext: &[u8]) -> SyncResult<Vec<u8>> {
        match self.kind {
            CipherKind::ChaCha20Poly1305 => decrypt_chacha(&self.bytes, ciphertext),
            CipherKind::LegacyAesCbc => decrypt_aes_cbc(&self.bytes, ciphertext),
        }
    }
}

fn encrypt_chacha(key: &[u8; 32], plaintext: &[u8]) -> SyncResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn decrypt_chacha(key: &[u8; 32], data: &[u8]) -> SyncResult<Vec<u8>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(SyncError::Crypto(
            "Data too short to contain nonce and tag".to_string(),
        ));
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let (nonce, encrypted) = data.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce), encrypted)
        .map_err(|e| SyncError::Crypto(format!("Decryption failed: {}", e)))
}

fn encrypt_aes_cbc(key: &[u8; 32], plaintext: &[u8]) -> SyncResult<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new(key.into(), &iv.into());
    let len = plaintext.len();
    let mut buffer = vec![0u8; len + IV_SIZE];
    buffer[..len].copy_from_slice(plaintext);

    let ciphertext = encryptor
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, len)
        .map_err(|_| SyncError::Crypto("Encryption failed: padding".to_string()))?;

    let mut result = Vec::with_capacity(IV_SIZE + ciphertext.len());
    result.extend_from_slice(&iv);
    result.extend_from_slice(ciphertext);
    Ok(result)
}

fn decrypt_aes_cbc(key: &[u8; 32], data: &[u8]) -> SyncResult<Vec<u8>> {
    if data.len() < 2 * IV_SIZE || data.len() % IV_SIZE != 0 {
        return Err(SyncError::Crypto(
            "Data too short or not block aligned".to_string(),
        ));
    }

    let (iv, ciphertext) = data.split_at(IV_SIZE);
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    let mut buffer = ciphertext.to_vec();

    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| SyncError::Crypto("Decryption failed: bad padding".to_string()))?;

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [CipherKind; 2] = [CipherKind::ChaCha20Poly1305, CipherKind::LegacyAesCbc];

    #[test]
    fn test_generate_key() {
        let key1 = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        let key2 = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        assert_ne!(key1.bytes, key2.bytes);
        assert_ne!(key1.fingerprint(), key2.fingerprint());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_all_kinds() {
        for kind in KINDS {
            let key = SymmetricKey::generate(kind, 1);
            let plaintext = b"Hello, circle!";
            let ciphertext = key.encrypt(plaintext).unwrap();
            assert_eq!(key.decrypt(&ciphertext).unwrap(), plaintext.as_slice());
        }
    }

    #[test]
    fn test_encrypt_decrypt_empty_all_kinds() {
        for kind in KINDS {
            let key = SymmetricKey::generate(kind, 1);
            let ciphertext = key.encrypt(b"").unwrap();
            assert!(key.decrypt(&ciphertext).unwrap().is_empty());
        }
    }

    #[test]
    fn test_chacha_layout() {
        let key = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        let ciphertext = key.encrypt(b"Test").unwrap();
        assert_eq!(ciphertext.len(), NONCE_SIZE + 4 + TAG_SIZE);
    }

    #[test]
    fn test_cbc_layout() {
        let key = SymmetricKey::generate(CipherKind::LegacyAesCbc, 0);
        let ciphertext = key.encrypt(b"Test").unwrap();
        // iv + one padded block
        assert_eq!(ciphertext.len(), IV_SIZE + 16);

        let ciphertext = key.encrypt(&[0u8; 16]).unwrap();
        // a full block of plaintext gets a full block of padding
        assert_eq!(ciphertext.len(), IV_SIZE + 32);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        for kind in KINDS {
            let key = SymmetricKey::generate(kind, 0);
            let c1 = key.encrypt(b"Deterministic test").unwrap();
            let c2 = key.encrypt(b"Deterministic test").unwrap();
            assert_ne!(c1, c2);
        }
    }

    #[test]
    fn test_wrong_key_fails_chacha() {
        let key1 = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        let key2 = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        let ciphertext = key1.encrypt(b"Secret").unwrap();
        assert!(key2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_tampered_data_fails_chacha() {
        let key = SymmetricKey::generate(CipherKind::ChaCha20Poly1305, 0);
        let mut ciphertext = key.encrypt(b"Original message").unwrap();
        ciphertext[NONCE_SIZE] ^= 0xFF;
        assert!(key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        for kind in KINDS {
            let key = SymmetricKey::generate(kind, 0);
            let ciphertext = key.encrypt(b"Original message").unwrap();
            let result = key.decrypt(&ciphertext[..5]);
            assert!(matches!(result, Err(SyncError::Crypto(msg)) if msg.contains("too short")));
        }
    }

    #[test]
    fn test_cbc_misaligned_fails() {
        let key = SymmetricKey::generate(CipherKind::LegacyAesCbc, 0);
        let mut ciphertext = key.encrypt(b"Original message").unwrap();
        ciphertext.push(0);
        assert!(key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = SymmetricKey::from_bytes(CipherKind::ChaCha20Poly1305, 3, [0xAB; 32]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains("171"));
        assert!(!debug.to_lowercase().contains("abab"));
        assert!(debug.contains("generation: 3"));
    }
}
