//! AES-256-GCM sealing for OAuth tokens at rest.
//!
//! Access and refresh tokens are sealed separately, each with its own random
//! nonce. The master key comes from `CRM_SYNC_ENCRYPTION_KEY` and never
//! touches disk.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

/// A sealed token as stored in SQLite: base64 ciphertext plus base64 nonce.
#[derive(Clone, Debug, PartialEq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

/// Cipher bound to the store's master key.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build from a base64-encoded 32-byte master key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<Sealed> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        Ok(Sealed {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// Fails on wrong key, corrupted data, or tampering.
    pub fn open(&self, sealed: &Sealed) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce = BASE64.decode(&sealed.nonce).context("Failed to decode nonce")?;

        if nonce.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| anyhow!("Token decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }

    /// Seal an optional token; `None` stays `None`.
    pub fn seal_optional(&self, plaintext: Option<&str>) -> Result<Option<Sealed>> {
        plaintext.map(|p| self.seal(p)).transpose()
    }
}

/// Decode a base64 master key and check it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}
