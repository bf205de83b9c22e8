//! Symmetric encryption of credential secrets at rest.
//!
//! Secrets are sealed with AES-256-GCM. The stored form is base64 of
//! `nonce || ciphertext`, so every field carries its own random nonce and
//! two encryptions of the same token never produce the same text.
//!
//! The empty string is a fixed point in both directions: an empty secret
//! is stored as an empty string and decrypting one yields an empty string.

use crate::error::CipherError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Encrypts and decrypts secret fields with a deployment-provided key.
#[derive(Clone)]
pub struct Cipher {
    inner: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Creates a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless the key is exactly 32 bytes.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_LEN {
            return Err(CipherError::InvalidKey {
                reason: format!("expected {KEY_LEN} bytes, got {}", key.len()),
            });
        }
        let inner = Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self { inner })
    }

    /// Creates a cipher from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not base64 or has the wrong length.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CipherError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey {
                reason: format!("key is not valid base64: {e}"),
            })?;
        Self::from_key_bytes(&bytes)
    }

    /// Encrypts a secret. Empty input encrypts to an empty string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .inner
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::EncryptionFailed {
                reason: e.to_string(),
            })?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Decrypts a secret. Empty input decrypts to an empty string.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let data = STANDARD
            .decode(ciphertext)
            .map_err(|e| CipherError::DecryptionFailed {
                reason: format!("ciphertext is not valid base64: {e}"),
            })?;
        if data.len() <= NONCE_LEN {
            return Err(CipherError::DecryptionFailed {
                reason: "ciphertext too short".to_string(),
            });
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .inner
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::DecryptionFailed {
                reason: "authentication tag mismatch".to_string(),
            })?;
        String::from_utf8(plain).map_err(|_| CipherError::DecryptionFailed {
            reason: "plaintext is not UTF-8".to_string(),
        })
    }

    /// Encrypts an optional secret; `None` and empty strings stay `None`.
    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, CipherError> {
        match plaintext {
            Some(value) if !value.is_empty() => self.encrypt(value).map(Some),
            _ => Ok(None),
        }
    }

    /// Decrypts an optional secret, mapping empty results to `None`.
    pub fn decrypt_opt(&self, ciphertext: Option<&str>) -> Result<Option<String>, CipherError> {
        match ciphertext {
            Some(value) => {
                let plain = self.decrypt(value)?;
                Ok((!plain.is_empty()).then_some(plain))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_key_bytes(&[7u8; 32]).expect("valid key")
    }

    #[test]
    fn round_trips_non_empty_strings() {
        let c = cipher();
        let long = "x".repeat(4096);
        for secret in ["tok1", "xoxb-1234-abcd", "üñíçødé", long.as_str()] {
            let sealed = c.encrypt(secret).expect("encrypt");
            assert_ne!(sealed, secret);
            assert_eq!(c.decrypt(&sealed).expect("decrypt"), secret);
        }
    }

    #[test]
    fn empty_is_a_fixed_point() {
        let c = cipher();
        assert_eq!(c.encrypt("").expect("encrypt"), "");
        assert_eq!(c.decrypt("").expect("decrypt"), "");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let c = cipher();
        let a = c.encrypt("same").expect("encrypt");
        let b = c.encrypt("same").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn corrupted_ciphertext_is_a_decryption_error() {
        let c = cipher();
        let mut sealed = STANDARD.decode(c.encrypt("tok1").expect("encrypt")).expect("b64");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        let err = c.decrypt(&STANDARD.encode(sealed)).unwrap_err();
        assert!(matches!(err, CipherError::DecryptionFailed { .. }));
    }

    #[test]
    fn garbage_and_truncated_input_fail() {
        let c = cipher();
        assert!(c.decrypt("not base64 at all!").is_err());
        assert!(c.decrypt(&STANDARD.encode([1u8; 4])).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = cipher().encrypt("tok1").expect("encrypt");
        let other = Cipher::from_key_bytes(&[8u8; 32]).expect("valid key");
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn key_length_is_checked() {
        assert!(Cipher::from_key_bytes(&[0u8; 16]).is_err());
        assert!(Cipher::from_base64_key(&STANDARD.encode([0u8; 32])).is_ok());
        assert!(Cipher::from_base64_key("???").is_err());
    }

    #[test]
    fn optional_helpers_skip_absent_values() {
        let c = cipher();
        assert_eq!(c.encrypt_opt(None).expect("encrypt"), None);
        assert_eq!(c.encrypt_opt(Some("")).expect("encrypt"), None);
        let sealed = c.encrypt_opt(Some("k")).expect("encrypt");
        assert_eq!(
            c.decrypt_opt(sealed.as_deref()).expect("decrypt"),
            Some("k".to_string())
        );
    }
}
