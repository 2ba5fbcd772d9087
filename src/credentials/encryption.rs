//! AES-256-GCM sealing of individual token strings.
//!
//! Each value gets its own random nonce. The key is 32 bytes, supplied
//! base64-encoded from the environment and held in memory only.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Token cipher bound to one master key.
#[derive(Clone)]
pub struct Cipher {
    inner: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;
        Self::from_bytes(&key_bytes)
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }
        let inner = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { inner })
    }

    /// Encrypt `plaintext`, returning `(ciphertext, nonce)` both base64-encoded.
    pub fn seal(&self, plaintext: &str) -> Result<(String, String)> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok((BASE64.encode(ciphertext), BASE64.encode(nonce)))
    }

    /// Decrypt a value produced by [`Cipher::seal`]. Fails on a wrong key,
    /// a mismatched nonce or tampered ciphertext.
    pub fn open(&self, ciphertext: &str, nonce: &str) -> Result<String> {
        let ciphertext_bytes = BASE64
            .decode(ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let plaintext = self
            .inner
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext_bytes.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Seal an optional value, keeping None as None.
    pub fn seal_opt(&self, plaintext: Option<&str>) -> Result<(Option<String>, Option<String>)> {
        match plaintext {
            Some(value) => {
                let (ciphertext, nonce) = self.seal(value)?;
                Ok((Some(ciphertext), Some(nonce)))
            }
            None => Ok((None, None)),
        }
    }
}
