//! Hybrid per-block authenticated encryption
//!
//! Envelope layout on disk: `E (32 bytes) || nonce (12 bytes) || GCM
//! ciphertext + tag`, where `E` is a fresh ephemeral Ristretto public point
//! drawn per block. The working key is `SHA256(column_key || encode(s * E))`
//! with `s` the long-term master scalar, so every block encrypts under a
//! distinct AES-256-GCM key even within one column.

use super::{KEY_SIZE, NONCE_SIZE, POINT_SIZE, TAG_SIZE};
use crate::{LockboxError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Encrypts and decrypts the blocks of a single column.
///
/// The long-term scalar is shared with every other column of the file (it is
/// the master scalar); per-column separation comes from mixing the column
/// key into the working key. Callers must not assume per-column forward
/// secrecy.
pub struct ColumnCipher {
    column: String,
    key: [u8; KEY_SIZE],
    secret: Scalar,
}

impl ColumnCipher {
    pub fn new(column: impl Into<String>, key: [u8; KEY_SIZE], secret: Scalar) -> Self {
        Self {
            column: column.into(),
            key,
            secret,
        }
    }

    /// Column this cipher belongs to.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Encrypt a serialized column payload into the block envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        // Fresh ephemeral keypair per block
        let ephemeral_secret = random_scalar()?;
        let ephemeral_public = RistrettoPoint::mul_base(&ephemeral_secret);

        let working_key = self.working_key(&ephemeral_public);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&working_key));

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|e| {
            LockboxError::EncryptionFailed(format!("failed to generate nonce: {e}"))
        })?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| {
                LockboxError::EncryptionFailed(format!(
                    "AES-GCM encryption failed for column {}: {e}",
                    self.column
                ))
            })?;

        let mut envelope = Vec::with_capacity(POINT_SIZE + NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(ephemeral_public.compress().as_bytes());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Decrypt a block envelope back into the serialized column payload.
    ///
    /// A failed GCM tag, a short envelope, and an undecodable point all
    /// surface as the same authentication failure: the caller cannot tell a
    /// wrong password from a corrupted block.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < POINT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(LockboxError::AuthenticationFailed(self.column.clone()));
        }

        let ephemeral_public = CompressedRistretto::from_slice(&envelope[..POINT_SIZE])
            .ok()
            .and_then(|c| c.decompress())
            .ok_or_else(|| LockboxError::AuthenticationFailed(self.column.clone()))?;
        let nonce = &envelope[POINT_SIZE..POINT_SIZE + NONCE_SIZE];
        let ciphertext = &envelope[POINT_SIZE + NONCE_SIZE..];

        let working_key = self.working_key(&ephemeral_public);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&working_key));

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| LockboxError::AuthenticationFailed(self.column.clone()))
    }

    /// Per-block working key: SHA256(column_key || encode(secret * E)).
    fn working_key(&self, ephemeral_public: &RistrettoPoint) -> [u8; KEY_SIZE] {
        let shared = ephemeral_public * self.secret;
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(shared.compress().as_bytes());
        hasher.finalize().into()
    }
}

impl Drop for ColumnCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ColumnCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnCipher")
            .field("column", &self.column)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Draw a uniform scalar from 64 bytes of system randomness.
fn random_scalar() -> Result<Scalar> {
    let mut wide = [0u8; 64];
    getrandom::getrandom(&mut wide)
        .map_err(|e| LockboxError::EncryptionFailed(format!("failed to generate scalar: {e}")))?;
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    Ok(scalar)
}
