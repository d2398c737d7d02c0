//! Cryptographic primitives for lockbox files
//!
//! Two-level key hierarchy (password -> master key -> per-column keys) and
//! the per-block hybrid envelope: an ephemeral Ristretto Diffie-Hellman
//! exchange hash-combined with the column key, then AES-256-GCM over the
//! serialized column payload.

pub mod cipher;
pub mod keys;

pub use cipher::ColumnCipher;
pub use keys::{derive_column_key, generate_salt, MasterKey};

/// Encryption configuration constants
pub const KEY_SIZE: usize = 32; // 256 bits
pub const NONCE_SIZE: usize = 12; // 96 bits for GCM
pub const TAG_SIZE: usize = 16; // 128 bits
pub const SALT_SIZE: usize = 32; // 256 bits
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Compressed Ristretto point size (ephemeral public key in the envelope)
pub const POINT_SIZE: usize = 32;

/// Fixed envelope framing overhead per encrypted block
pub const ENVELOPE_OVERHEAD: usize = POINT_SIZE + NONCE_SIZE + TAG_SIZE; // 60 bytes
