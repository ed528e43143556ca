//! Password hashing and at-rest secret encryption.
//!
//! Password hashes are Argon2id PHC strings. A `$FAST$<secret>` hash is also
//! recognized so test setups avoid Argon2's intentional slowness; it must never
//! be written by production code paths.
//!
//! Secrets stored encrypted carry the `$ENC$` prefix followed by the base64 of
//! `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext`.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use chacha20poly1305::{
    ChaCha20Poly1305, KeyInit, Nonce,
    aead::{Aead, rand_core::RngCore},
};
use subtle::ConstantTimeEq;

const FAST_HASH_PREFIX: &str = "$FAST$";
const ENCRYPTED_PREFIX: &str = "$ENC$";
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
    #[error("invalid secret key: expected 32 hex-encoded bytes")]
    InvalidKey,
    #[error("secret is encrypted but no secret key is configured")]
    MissingKey,
    #[error("invalid encrypted secret")]
    InvalidData,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

impl From<argon2::password_hash::Error> for SecretError {
    fn from(err: argon2::password_hash::Error) -> Self {
        SecretError::Hash(err)
    }
}

/// Hashes a secret into an Argon2id PHC string.
pub fn hash_password(secret: &[u8]) -> Result<String, SecretError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(secret, &salt)?;
    Ok(hash.to_string())
}

/// Builds a test-only hash that [`verify_password`] accepts instantly.
pub fn fast_hash(secret: &str) -> String {
    format!("{FAST_HASH_PREFIX}{secret}")
}

/// Verifies a secret against a stored hash.
///
/// Returns `Ok(false)` on mismatch and `Err` only if the stored hash is malformed.
pub fn verify_password(secret: &[u8], stored: &str) -> Result<bool, SecretError> {
    if let Some(expected) = stored.strip_prefix(FAST_HASH_PREFIX) {
        return Ok(constant_time_eq(expected.as_bytes(), secret));
    }
    let parsed = PasswordHash::new(stored)?;
    match Argon2::default().verify_password(secret, &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Key used to encrypt secrets at rest.
#[derive(Clone)]
pub struct SecretKey {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn from_hex(s: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(s.trim()).map_err(|_| SecretError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| SecretError::InvalidKey)?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        chacha20poly1305::aead::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed)?;
        let mut data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        data.extend_from_slice(&nonce_bytes);
        data.extend_from_slice(&ciphertext);
        Ok(format!(
            "{ENCRYPTED_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(data)
        ))
    }

    fn decrypt_raw(&self, encoded: &str) -> Result<String, SecretError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SecretError::InvalidData)?;
        if data.len() < NONCE_SIZE {
            return Err(SecretError::InvalidData);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SecretError::DecryptionFailed)?;
        String::from_utf8(plain).map_err(|_| SecretError::InvalidData)
    }
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Returns the plain value of a possibly encrypted secret.
pub fn reveal(value: &str, key: Option<&SecretKey>) -> Result<String, SecretError> {
    match value.strip_prefix(ENCRYPTED_PREFIX) {
        None => Ok(value.to_string()),
        Some(encoded) => key.ok_or(SecretError::MissingKey)?.decrypt_raw(encoded),
    }
}
