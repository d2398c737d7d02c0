//! Lockbox Encrypted Columnar Storage
//!
//! A self-describing encrypted file format (`.lbx`) for Apache Arrow data.
//! Each column of a record batch is serialized as an independent Arrow IPC
//! stream, encrypted under a column-specific key derived from a user
//! password, checksummed, and appended to the file. A JSON metadata trailer
//! holds the schema, encryption parameters, block directory, and audit log.

pub mod crypto;
pub mod format;
pub mod ingest;
pub mod lockbox;
pub mod metadata;
pub mod query;

// Re-export main types
pub use format::{CancellationToken, LockboxFile};
pub use lockbox::{Info, Lockbox, ReadOptions, WriteOptions};
pub use metadata::{BlockInfo, Metadata};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum LockboxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("unsupported file version: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("authentication failed for column {0}")]
    AuthenticationFailed(String),

    #[error("checksum mismatch for column {0}")]
    ChecksumMismatch(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    #[error("schema mismatch: {0}")]
    ShapeMismatch(String),

    #[error("query parse error: {0}")]
    QueryParseError(String),

    #[error("query error: {0}")]
    QueryError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("metadata serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, LockboxError>;
