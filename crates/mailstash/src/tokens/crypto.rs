//! Token encryption
//!
//! AES-256-GCM with a random 96-bit nonce per encryption; the stored
//! envelope is base64(nonce || ciphertext). The key is process-wide,
//! loaded once at startup from `ENCRYPTION_KEY`.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{EngineError, Result};

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Authenticated cipher for token columns
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build a cipher from the 32-byte process key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Encrypt a plaintext token into the storage envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Config(format!("token encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    /// Decrypt a storage envelope back to the plaintext token.
    ///
    /// Fails when the key is wrong or the stored value was damaged; GCM
    /// authenticates the ciphertext.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let combined = BASE64
            .decode(encrypted)
            .map_err(|e| EngineError::Config(format!("stored token is not valid base64: {}", e)))?;

        if combined.len() < NONCE_SIZE {
            return Err(EngineError::Config(format!(
                "stored token envelope too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| {
                EngineError::Config(
                    "token decryption failed; wrong ENCRYPTION_KEY or damaged row".to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Config(format!("decrypted token is not UTF-8: {}", e)))
    }
}
