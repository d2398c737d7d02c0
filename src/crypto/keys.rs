//! Key derivation for the master/column key hierarchy

use super::{KEY_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};
use crate::{LockboxError, Result};
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

/// Master key derived from a user password.
///
/// Carries the 32-byte PBKDF2 output plus the long-term Ristretto
/// scalar/point pair derived deterministically from it. The scalar is the
/// secret side of the per-block Diffie-Hellman exchange; given the same
/// password and salt every field reproduces bit-exactly.
pub struct MasterKey {
    /// PBKDF2-HMAC-SHA256 output
    pub data: [u8; KEY_SIZE],
    /// Salt the key was derived with
    pub salt: Vec<u8>,
    /// Long-term secret scalar (key bytes reduced mod the group order)
    pub scalar: Scalar,
    /// Public point `scalar * G`
    pub point: RistrettoPoint,
}

impl MasterKey {
    /// Generate a master key from a password with a fresh random salt.
    pub fn generate(password: &str) -> Result<Self> {
        let mut salt = vec![0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|e| LockboxError::EncryptionFailed(format!("failed to generate salt: {e}")))?;
        Ok(Self::derive(password, &salt))
    }

    /// Derive the master key from a password and an existing salt.
    /// Deterministic: the same inputs always yield the same key material.
    pub fn derive(password: &str, salt: &[u8]) -> Self {
        let mut data = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut data);

        let scalar = Scalar::from_bytes_mod_order(data);
        let point = RistrettoPoint::mul_base(&scalar);

        Self {
            data,
            salt: salt.to_vec(),
            scalar,
            point,
        }
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("data", &"<redacted>")
            .field("salt", &self.salt.len())
            .finish()
    }
}

/// Derive a column-specific key from the master key bytes and column name.
pub fn derive_column_key(master: &[u8], column_name: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut input = Vec::with_capacity(master.len() + column_name.len());
    input.extend_from_slice(master);
    input.extend_from_slice(column_name.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(&input, salt, PBKDF2_ITERATIONS, &mut key);
    input.zeroize();
    key
}

/// Generate a fresh random salt.
pub fn generate_salt() -> Result<[u8; SALT_SIZE]> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::getrandom(&mut salt)
        .map_err(|e| LockboxError::EncryptionFailed(format!("failed to generate salt: {e}")))?;
    Ok(salt)
}
