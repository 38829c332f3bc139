//! Symmetric encryption for the directory service channel.
//!
//! The key is derived once from a password and salt with Argon2id, so both sides
//! arrive at the same key without negotiation. Each message is sealed with
//! XChaCha20-Poly1305 under a fresh random nonce and carried as base64 text:
//!
//! ```text
//! base64( [Nonce(24)] [Ciphertext + Tag(N + 16)] )
//! ```

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{constants, IpcError, Result};

/// XChaCha20 nonce length
pub const NONCE_SIZE: usize = 24;

/// Derived key length
pub const KEY_SIZE: usize = 32;

/// Argon2id memory cost in KiB
const KDF_MEMORY_KIB: u32 = 19 * 1024;
/// Argon2id passes
const KDF_ITERATIONS: u32 = 2;
/// Argon2id lanes
const KDF_PARALLELISM: u32 = 1;

/// Cipher bound to a password+salt derived key
#[derive(Clone)]
pub struct ChannelCipher {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCipher").finish_non_exhaustive()
    }
}

impl ChannelCipher {
    /// Derive the channel key from `password` and `salt`.
    ///
    /// Derivation is deterministic: the same inputs always yield the same key.
    pub fn new(password: &str, salt: &[u8]) -> Result<Self> {
        let mut key = derive_key(password.as_bytes(), salt)?;
        let cipher = Self::from_key(&key);
        key.zeroize();
        Ok(cipher)
    }

    pub fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Seal `plaintext`, prefixing the random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| IpcError::EncryptionFailure)?;

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| IpcError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(IpcError::InvalidArgument(
                constants::ERR_CIPHERTEXT_TOO_SHORT.to_string(),
            ));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| IpcError::DecryptionFailure)
    }

    /// Encrypt text into its base64 wire form.
    pub fn encrypt_text(&self, text: &str) -> Result<String> {
        Ok(STANDARD.encode(self.encrypt(text.as_bytes())?))
    }

    pub fn decrypt_text(&self, text: &str) -> Result<String> {
        let data = STANDARD
            .decode(text.trim())
            .map_err(|_| IpcError::DecryptionFailure)?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext).map_err(|_| IpcError::DecryptionFailure)
    }

    /// Parse a salt given either as a brace list (`{0x59, 0x06, 0x3e}`) or as plain hex.
    pub fn parse_salt(text: &str) -> Result<Vec<u8>> {
        let text = text.trim();
        if let Some(list) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            return list
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| {
                    let digits = t.trim_start_matches("0x").trim_start_matches("0X");
                    u8::from_str_radix(digits, 16)
                        .map_err(|_| IpcError::ConfigError(format!("Invalid salt byte {t:?}")))
                })
                .collect();
        }

        if text.len() % 2 != 0 {
            return Err(IpcError::ConfigError(
                "Hex salt must have an even number of digits".to_string(),
            ));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| {
                text.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| IpcError::ConfigError(format!("Invalid hex salt {text:?}")))
            })
            .collect()
    }
}

fn derive_key(password: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let params = Params::new(
        KDF_MEMORY_KIB,
        KDF_ITERATIONS,
        KDF_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| IpcError::KeyDerivation(format!("Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| IpcError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
