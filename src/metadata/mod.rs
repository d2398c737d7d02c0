//! File metadata: header, encryption parameters, block directory, audit log
//!
//! The metadata trailer is stored as pretty-printed JSON at the tail of the
//! file. The Arrow schema travels inside it as a zero-batch IPC stream so a
//! lockbox file is self-describing without a sidecar.

use crate::crypto::{PBKDF2_ITERATIONS, SALT_SIZE};
use crate::{LockboxError, Result};
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// Current version of the lockbox file format
pub const FORMAT_VERSION: u32 = 1;
/// Magic bytes identifying a lockbox file
pub const MAGIC: &[u8; 8] = b"LOCKBOX\0";

/// Fixed-size file header, mirrored in the JSON trailer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            reserved: 0,
        }
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Encryption configuration recorded in the trailer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionParams {
    /// "AES-256-GCM"
    pub algorithm: String,
    /// "PBKDF2"
    pub key_derivation: String,
    pub iterations: u32,
    pub salt_size: usize,
    /// Optional per-column salts (column name -> salt)
    pub column_salts: HashMap<String, Vec<u8>>,
    #[serde(with = "b64")]
    pub master_salt: Vec<u8>,
}

impl EncryptionParams {
    fn new(master_salt: Vec<u8>) -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            key_derivation: "PBKDF2".to_string(),
            iterations: PBKDF2_ITERATIONS,
            salt_size: SALT_SIZE,
            column_salts: HashMap::new(),
            master_salt,
        }
    }
}

/// A single access event in the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntry {
    pub timestamp: DateTime<Utc>,
    pub principal: String,
    /// "read" or "write"
    pub action: String,
    pub resource: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// Audit information, persisted on every trailer rewrite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrail {
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,
    pub access_log: Vec<AccessEntry>,
    pub version: u32,
}

/// Describes one encrypted column block on disk.
///
/// `offset` and `length` address the encrypted envelope; `checksum` is
/// SHA-256 over exactly those bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub column_name: String,
    pub offset: u64,
    pub length: u64,
    pub row_count: u64,
    pub compressed: bool,
    #[serde(with = "b64")]
    pub checksum: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Complete lockbox metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub header: FileHeader,
    /// Live schema; serialized separately as `schema_bytes`
    #[serde(skip, default = "empty_schema")]
    pub schema: SchemaRef,
    #[serde(with = "b64")]
    pub schema_bytes: Vec<u8>,
    pub encryption: EncryptionParams,
    pub audit_trail: AuditTrail,
    pub block_info: Vec<BlockInfo>,
}

fn empty_schema() -> SchemaRef {
    Arc::new(Schema::empty())
}

impl Metadata {
    /// Create metadata for a new lockbox file.
    pub fn new(schema: SchemaRef, master_salt: &[u8], created_by: &str) -> Result<Self> {
        validate_schema(&schema)?;
        let schema_bytes = schema_to_ipc(&schema)?;

        let now = Utc::now();
        let audit_trail = AuditTrail {
            created_at: now,
            created_by: created_by.to_string(),
            modified_at: now,
            modified_by: created_by.to_string(),
            access_log: Vec::new(),
            version: 1,
        };

        Ok(Self {
            header: FileHeader::new(),
            schema,
            schema_bytes,
            encryption: EncryptionParams::new(master_salt.to_vec()),
            audit_trail,
            block_info: Vec::new(),
        })
    }

    /// Serialize to pretty JSON. The schema blob is refreshed from the live
    /// schema on every call so the persisted form cannot desynchronize.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        self.schema_bytes = schema_to_ipc(&self.schema)?;
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from JSON, reconstructing the schema from its IPC blob.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut meta: Metadata = serde_json::from_slice(data)?;
        if meta.schema_bytes.is_empty() {
            return Err(LockboxError::InvalidFileFormat(
                "metadata has no schema".to_string(),
            ));
        }
        meta.schema = schema_from_ipc(&meta.schema_bytes)?;
        Ok(meta)
    }

    /// Append a block to the directory. Does not deduplicate: a later write
    /// for the same column appends another block, which readers treat as a
    /// logical continuation of the column.
    pub fn add_block(
        &mut self,
        column_name: &str,
        offset: u64,
        length: u64,
        row_count: u64,
        checksum: Vec<u8>,
    ) {
        self.block_info.push(BlockInfo {
            column_name: column_name.to_string(),
            offset,
            length,
            row_count,
            compressed: false,
            checksum,
            orig_size: None,
            mime_type: None,
        });
    }

    /// Append an access event to the audit log.
    pub fn log_access(
        &mut self,
        principal: &str,
        action: &str,
        resource: &str,
        success: bool,
        details: &str,
    ) {
        self.audit_trail.access_log.push(AccessEntry {
            timestamp: Utc::now(),
            principal: principal.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            success,
            details: details.to_string(),
        });
    }

    /// Record a modification.
    pub fn touch(&mut self, modified_by: &str) {
        self.audit_trail.modified_at = Utc::now();
        self.audit_trail.modified_by = modified_by.to_string();
    }

    /// All directory blocks for one column, in directory order.
    pub fn blocks_for_column(&self, column_name: &str) -> Vec<&BlockInfo> {
        self.block_info
            .iter()
            .filter(|b| b.column_name == column_name)
            .collect()
    }
}

/// Serialize a schema as a zero-batch Arrow IPC stream.
pub fn schema_to_ipc(schema: &Schema) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, schema)?;
        writer.finish()?;
    }
    Ok(buf)
}

/// Reconstruct a schema from a zero-batch Arrow IPC stream.
pub fn schema_from_ipc(data: &[u8]) -> Result<SchemaRef> {
    let reader = StreamReader::try_new(Cursor::new(data), None)?;
    Ok(reader.schema())
}

/// Reject schemas outside the supported type set or with duplicate names.
pub fn validate_schema(schema: &Schema) -> Result<()> {
    if schema.fields().is_empty() {
        return Err(LockboxError::ShapeMismatch(
            "schema has no fields".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for field in schema.fields() {
        if !seen.insert(field.name().as_str()) {
            return Err(LockboxError::ShapeMismatch(format!(
                "duplicate field name: {}",
                field.name()
            )));
        }
        if !type_supported(field.data_type()) {
            return Err(LockboxError::UnsupportedType(format!(
                "{} ({})",
                field.data_type(),
                field.name()
            )));
        }
    }
    Ok(())
}

fn type_supported(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Boolean
            | DataType::Utf8
            | DataType::Binary
            | DataType::Date32
            | DataType::Timestamp(_, _)
            | DataType::Duration(_)
            | DataType::Time32(_)
            | DataType::Time64(_)
    )
}

/// Byte fields serialize as base64 strings, matching the trailer format.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::Field;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn test_new_metadata() {
        let meta = Metadata::new(test_schema(), &[1u8; SALT_SIZE], "tester").unwrap();
        assert_eq!(meta.header.magic, *MAGIC);
        assert_eq!(meta.header.version, FORMAT_VERSION);
        assert_eq!(meta.audit_trail.created_by, "tester");
        assert_eq!(meta.audit_trail.version, 1);
        assert!(meta.block_info.is_empty());
        assert_eq!(meta.encryption.iterations, PBKDF2_ITERATIONS);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut meta = Metadata::new(test_schema(), &[1u8; SALT_SIZE], "tester").unwrap();
        meta.add_block("id", 28, 100, 2, vec![0xAB; 32]);
        meta.log_access("system", "write", "record", true, "wrote 2 rows");

        let bytes = Metadata::serialize(&mut meta).unwrap();
        let restored = Metadata::deserialize(&bytes).unwrap();

        assert_eq!(restored.schema.as_ref(), meta.schema.as_ref());
        assert_eq!(restored.block_info.len(), 1);
        assert_eq!(restored.block_info[0].column_name, "id");
        assert_eq!(restored.block_info[0].checksum, vec![0xAB; 32]);
        assert_eq!(restored.audit_trail.access_log.len(), 1);
        assert_eq!(restored.encryption.master_salt, vec![1u8; SALT_SIZE]);
    }

    #[test]
    fn test_schema_blob_refreshed_on_serialize() {
        let mut meta = Metadata::new(test_schema(), &[1u8; SALT_SIZE], "tester").unwrap();
        // Desynchronize the blob on purpose
        meta.schema_bytes = vec![0u8; 4];
        let bytes = Metadata::serialize(&mut meta).unwrap();
        let restored = Metadata::deserialize(&bytes).unwrap();
        assert_eq!(restored.schema.fields().len(), 2);
    }

    #[test]
    fn test_blocks_for_column() {
        let mut meta = Metadata::new(test_schema(), &[1u8; SALT_SIZE], "tester").unwrap();
        meta.add_block("id", 28, 100, 2, vec![0; 32]);
        meta.add_block("name", 128, 90, 2, vec![0; 32]);
        meta.add_block("id", 218, 50, 1, vec![0; 32]);

        let blocks = meta.blocks_for_column("id");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 28);
        assert_eq!(blocks[1].offset, 218);
    }

    #[test]
    fn test_validate_schema_rejects_duplicates() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("a", DataType::Utf8, true),
        ]);
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn test_validate_schema_rejects_unsupported_type() {
        let schema = Schema::new(vec![Field::new(
            "nested",
            DataType::List(Arc::new(Field::new("item", DataType::Int64, true))),
            true,
        )]);
        assert!(matches!(
            validate_schema(&schema),
            Err(LockboxError::UnsupportedType(_))
        ));
    }
}
