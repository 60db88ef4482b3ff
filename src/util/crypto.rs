//! Credential encryption at rest (AES-256-GCM).
//!
//! API secrets live encrypted in the configuration store and travel
//! encrypted inside task payloads. The worker decrypts them only at adapter
//! construction time, through a cipher value injected at startup — there is
//! no process-global key state.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for API credentials.
///
/// Wire format: base64( nonce(12) || ciphertext ).
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build from a 64-hex-character (32-byte) key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self> {
        if key_hex.len() != 64 {
            bail!("encryption key must be 64 hex characters (32 bytes)");
        }
        let key_bytes = hex::decode(key_hex).context("encryption key is not valid hex")?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encrypt failed: {e}"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let payload = BASE64
            .decode(encrypted.trim())
            .context("encrypted credential is not valid base64")?;
        if payload.len() <= NONCE_LEN {
            bail!("encrypted credential too short");
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("decrypt failed: {e}"))?;

        String::from_utf8(plaintext).context("decrypted credential is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn round_trips_secrets() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();
        let encrypted = cipher.encrypt("super-secret-api-key").unwrap();
        assert_ne!(encrypted, "super-secret-api-key");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "super-secret-api-key");
    }

    #[test]
    fn rejects_short_keys() {
        assert!(CredentialCipher::from_hex_key("abcd").is_err());
    }

    #[test]
    fn rejects_tampered_payloads() {
        let cipher = CredentialCipher::from_hex_key(TEST_KEY).unwrap();
        let encrypted = cipher.encrypt("secret").unwrap();
        let flipped = if encrypted.starts_with('A') { "B" } else { "A" };
        let tampered = format!("{flipped}{}", &encrypted[1..]);
        assert!(cipher.decrypt(&tampered).is_err());
    }
}
