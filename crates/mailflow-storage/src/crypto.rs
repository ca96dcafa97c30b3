//! At-rest encryption for webhook credentials
//!
//! Auth values (Basic passwords, bearer tokens, HMAC secrets) are stored
//! AES-256-GCM encrypted. The blob layout is `nonce || ciphertext`,
//! base64-encoded; a fresh random nonce is generated per encryption.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mailflow_common::{Error, Result};

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for webhook auth values
#[derive(Clone)]
pub struct SecretCipher {
    key: Key<Aes256Gcm>,
}

impl SecretCipher {
    /// Build a cipher from a base64-encoded 32-byte key
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key_b64)
            .map_err(|e| Error::Crypto(format!("Invalid encryption key encoding: {}", e)))?;

        if bytes.len() != 32 {
            return Err(Error::Crypto(format!(
                "Encryption key must be 32 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    /// Encrypt a plaintext secret for storage
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a stored secret
    pub fn decrypt(&self, blob_b64: &str) -> Result<String> {
        let blob = BASE64
            .decode(blob_b64)
            .map_err(|e| Error::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        if blob.len() <= NONCE_LEN {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("Decrypted value is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        let key = BASE64.encode([7u8; 32]);
        SecretCipher::from_base64(&key).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = test_cipher();
        let blob = cipher.encrypt("whsec_1234567890").unwrap();

        assert_ne!(blob, "whsec_1234567890");
        assert_eq!(cipher.decrypt(&blob).unwrap(), "whsec_1234567890");
    }

    #[test]
    fn test_nonce_uniqueness() {
        let cipher = test_cipher();
        let a = cipher.encrypt("secret").unwrap();
        let b = cipher.encrypt("secret").unwrap();

        // Same plaintext must never produce the same blob
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let short = BASE64.encode([1u8; 16]);
        assert!(SecretCipher::from_base64(&short).is_err());
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let cipher = test_cipher();
        assert!(cipher.decrypt("AAAA").is_err());
    }
}
