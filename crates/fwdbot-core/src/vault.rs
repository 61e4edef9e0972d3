//! Token vault: authenticated encryption of bot credentials at rest.
//!
//! Stored layout: `base64( nonce(12B) || AES-256-GCM-seal(key, nonce, plain) )`.
//! The decrypted credential never leaves process memory and is never logged.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;

use crate::{errors::Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl TokenVault {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Resolve the vault key from configuration.
    ///
    /// - a configured base64 32-byte key is accepted as-is;
    /// - production without a configured key refuses to start;
    /// - otherwise a random process-lifetime key is generated (tokens
    ///   stored under it will not survive a restart, which is acceptable
    ///   for development).
    pub fn key_from_config(encoded: Option<&str>, production: bool) -> Result<[u8; KEY_LEN]> {
        match encoded {
            Some(raw) => {
                let bytes = BASE64
                    .decode(raw.trim())
                    .map_err(|_| Error::Config("ENCRYPTION_KEY must be base64".to_string()))?;
                let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
                    Error::Config("ENCRYPTION_KEY must decode to exactly 32 bytes".to_string())
                })?;
                Ok(key)
            }
            None if production => Err(Error::Config(
                "ENCRYPTION_KEY is required when ENVIRONMENT=production".to_string(),
            )),
            None => {
                tracing::warn!("no ENCRYPTION_KEY configured, generating a process-lifetime key");
                let mut key = [0u8; KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                Ok(key)
            }
        }
    }

    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let data = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| Error::Crypto("malformed base64 ciphertext".to_string()))?;

        if data.len() < NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::Crypto("decryption failed (tampered data or wrong key)".to_string()))?;

        String::from_utf8(plain)
            .map_err(|_| Error::Crypto("decrypted credential is not utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(byte: u8) -> TokenVault {
        TokenVault::new(&[byte; KEY_LEN])
    }

    #[test]
    fn round_trip() {
        let v = vault(0xAB);
        let token = "123456789:ABCdefGHIjklMNOpqrsTUVwxyz";
        let sealed = v.encrypt(token).unwrap();
        assert_ne!(sealed, token);
        assert_eq!(v.decrypt(&sealed).unwrap(), token);
    }

    #[test]
    fn fresh_nonce_per_call() {
        let v = vault(0xAB);
        let a = v.encrypt("same input").unwrap();
        let b = v.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = vault(0x01).encrypt("secret").unwrap();
        assert!(matches!(vault(0x02).decrypt(&sealed), Err(Error::Crypto(_))));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let v = vault(0xAB);
        let sealed = v.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(v.decrypt(&tampered), Err(Error::Crypto(_))));
    }

    #[test]
    fn short_and_malformed_inputs_fail() {
        let v = vault(0xAB);
        assert!(matches!(v.decrypt("AAAA"), Err(Error::Crypto(_))));
        assert!(matches!(v.decrypt("%%% not base64 %%%"), Err(Error::Crypto(_))));
    }

    #[test]
    fn key_from_config_rules() {
        // Valid configured key.
        let encoded = BASE64.encode([7u8; KEY_LEN]);
        assert_eq!(
            TokenVault::key_from_config(Some(&encoded), true).unwrap(),
            [7u8; KEY_LEN]
        );

        // Wrong length.
        let short = BASE64.encode([7u8; 16]);
        assert!(TokenVault::key_from_config(Some(&short), false).is_err());

        // Production without a key refuses to start.
        assert!(TokenVault::key_from_config(None, true).is_err());

        // Development generates one.
        assert!(TokenVault::key_from_config(None, false).is_ok());
    }
}
