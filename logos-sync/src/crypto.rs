//! End-to-end payload encryption.
//!
//! Every broadcast and every stored snapshot is sealed with AES-128-GCM
//! under the room key. Each message gets a fresh random 96-bit IV that
//! travels next to the ciphertext. The relay and the storage service only
//! ever see ciphertext.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

pub const IV_LENGTH: usize = 12;
pub const KEY_LENGTH: usize = 16;

/// Symmetric room key, shared out of band through the room link.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; KEY_LENGTH]);

impl RoomKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse the URL-safe base64 text form used in room links.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LENGTH] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {KEY_LENGTH} bytes, got {}", decoded.len())))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Vec<u8>,
}

pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let mut iv = [0u8; IV_LENGTH];
    iv.copy_from_slice(nonce.as_slice());
    Ok(EncryptedPayload { iv, ciphertext })
}

/// Fails on a wrong key, a wrong IV or any tampering with the ciphertext.
pub fn decrypt(key: &RoomKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LENGTH {
        return Err(CryptoError::InvalidIv(iv.len()));
    }
    key.cipher()
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    InvalidKey(String),
    InvalidIv(usize),
    EncryptionFailed,
    DecryptionFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKey(e) => write!(f, "Invalid room key: {e}"),
            CryptoError::InvalidIv(len) => {
                write!(f, "Invalid IV length {len}, expected {IV_LENGTH}")
            }
            CryptoError::EncryptionFailed => write!(f, "Encryption failed"),
            CryptoError::DecryptionFailed => write!(f, "Decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}
