//! Authenticated envelope encryption for credential payloads.
//!
//! Envelope format: `enc:v1:<nonce_b64>:<ciphertext_b64>` (URL-safe base64,
//! no padding). The record's owner and service are bound as associated data,
//! so an envelope copied onto another record fails to decrypt.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::VaultError;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// PBKDF2 iterations used when the configured key is not raw key material.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Default KDF salt.
pub const DEFAULT_KDF_SALT: &str = "wish_agent_vault_salt";

/// Process-wide credential cipher.
#[derive(Clone)]
pub struct EnvelopeCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EnvelopeCipher(<redacted>)")
    }
}

impl EnvelopeCipher {
    /// Build a cipher from the configured key.
    ///
    /// A base64 value decoding to exactly 32 bytes is used as the key
    /// directly. Any other non-empty value is stretched with
    /// PBKDF2-HMAC-SHA256.
    pub fn from_key(key: &str, salt: &str) -> Result<Self, VaultError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(VaultError::MissingKey);
        }

        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        match decode_raw_key(key) {
            Some(raw) => material.copy_from_slice(&raw),
            None => {
                tracing::debug!("vault key is not raw key material, deriving with PBKDF2");
                pbkdf2::pbkdf2_hmac::<Sha256>(
                    key.as_bytes(),
                    salt.as_bytes(),
                    PBKDF2_ITERATIONS,
                    &mut material[..],
                );
            }
        }

        let aead = ChaCha20Poly1305::new_from_slice(&material[..])
            .map_err(|e| VaultError::Crypto(format!("failed to initialize cipher: {}", e)))?;
        Ok(Self { aead })
    }

    /// Encrypt `plaintext` into an envelope bound to `aad`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| VaultError::Crypto(format!("failed to encrypt payload: {}", e)))?;

        Ok(format!(
            "{}{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Decrypt an envelope produced by [`seal`](Self::seal) with the same `aad`.
    pub fn open(&self, envelope: &str, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let body = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| VaultError::Crypto("envelope is invalid".to_string()))?;
        let (nonce_b64, ciphertext_b64) = body
            .split_once(':')
            .ok_or_else(|| VaultError::Crypto("envelope is invalid".to_string()))?;

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("failed to decode nonce: {}", e)))?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(VaultError::Crypto("nonce length is invalid".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("failed to decode payload: {}", e)))?;

        let plaintext = self
            .aead
            .decrypt(
                Nonce::from_slice(&nonce_raw),
                Payload {
                    msg: ciphertext.as_ref(),
                    aad,
                },
            )
            .map_err(|e| VaultError::Crypto(format!("failed to decrypt payload: {}", e)))?;
        Ok(Zeroizing::new(plaintext))
    }
}

fn decode_raw_key(key: &str) -> Option<Zeroizing<Vec<u8>>> {
    URL_SAFE_NO_PAD
        .decode(key.as_bytes())
        .or_else(|_| STANDARD.decode(key.as_bytes()))
        .ok()
        .map(Zeroizing::new)
        .filter(|bytes| bytes.len() == KEY_LEN)
}
