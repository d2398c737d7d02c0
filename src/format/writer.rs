//! Parallel column write pipeline
//!
//! Each column of a batch is wrapped in a one-field record, serialized to an
//! Arrow IPC stream, encrypted, and checksummed — concurrently across
//! columns on the rayon pool (bounded at the core count). Appending is
//! serial in schema order because block offsets are only known at write
//! time; the trailer is rewritten once after the last append.

use super::{CancellationToken, LockboxFile};
use crate::crypto::{derive_column_key, ColumnCipher, MasterKey};
use crate::metadata::BlockInfo;
use crate::{LockboxError, Result};
use arrow::array::ArrayRef;
use arrow::datatypes::{FieldRef, Schema};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// One fully prepared column: encrypted payload plus its checksum.
struct ColumnPayload {
    name: String,
    data: Vec<u8>,
    checksum: Vec<u8>,
    row_count: u64,
}

/// Writes encrypted record batches into a lockbox file.
pub struct Writer<'a> {
    file: &'a mut LockboxFile,
    ciphers: HashMap<String, ColumnCipher>,
}

impl LockboxFile {
    /// Create a writer, deriving the master key and every column key up
    /// front. A derivation failure aborts before anything touches the file.
    pub fn writer(&mut self, password: &str) -> Result<Writer<'_>> {
        if self.is_readonly() {
            return Err(LockboxError::InvalidArgument(
                "file is read-only".to_string(),
            ));
        }
        let ciphers = column_ciphers(self, password)?;
        Ok(Writer {
            file: self,
            ciphers,
        })
    }
}

/// Derive a cipher per schema field from the password and the file's salt.
pub(crate) fn column_ciphers(
    file: &LockboxFile,
    password: &str,
) -> Result<HashMap<String, ColumnCipher>> {
    if password.is_empty() {
        return Err(LockboxError::InvalidArgument(
            "password is required".to_string(),
        ));
    }

    let salt = file.metadata().encryption.master_salt.clone();
    let master = MasterKey::derive(password, &salt);

    let schema = file.schema();
    let mut ciphers = HashMap::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let key = derive_column_key(&master.data, field.name(), &salt);
        ciphers.insert(
            field.name().clone(),
            ColumnCipher::new(field.name().clone(), key, master.scalar),
        );
        log::debug!("derived column key for {}", field.name());
    }
    Ok(ciphers)
}

impl Writer<'_> {
    /// Write one record batch, optionally restricted to a subset of columns.
    ///
    /// Nothing is appended unless every targeted column serialized and
    /// encrypted successfully; the first per-column error in schema order is
    /// reported. A cancellation observed mid-pipeline leaves the trailer
    /// untouched, so partially appended bytes stay unreferenced.
    pub fn write_record(
        &mut self,
        batch: &RecordBatch,
        columns: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let schema = self.file.schema();
        check_batch_shape(&schema, batch)?;

        // Targeted columns, in schema order
        let mut work: Vec<(FieldRef, ArrayRef)> = Vec::new();
        if let Some(names) = columns {
            for name in names {
                if schema.index_of(name).is_err() {
                    return Err(LockboxError::ColumnNotFound(name.clone()));
                }
            }
        }
        for (i, field) in schema.fields().iter().enumerate() {
            if let Some(names) = columns {
                if !names.iter().any(|n| n == field.name()) {
                    continue;
                }
            }
            work.push((field.clone(), batch.column(i).clone()));
        }
        if work.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "no columns to write".to_string(),
            ));
        }

        let row_count = batch.num_rows() as u64;
        let ciphers = &self.ciphers;

        // Serialize, encrypt, and checksum every column in parallel.
        // Collect preserves schema order, so the first error wins by order.
        let results: Vec<Result<ColumnPayload>> = work
            .par_iter()
            .map(|(field, column)| {
                cancel.check()?;

                let bytes = serialize_column(field, column, row_count)?;
                let cipher = ciphers
                    .get(field.name())
                    .ok_or_else(|| LockboxError::ColumnNotFound(field.name().clone()))?;
                let encrypted = cipher.encrypt(&bytes)?;
                let checksum = Sha256::digest(&encrypted).to_vec();

                Ok(ColumnPayload {
                    name: field.name().clone(),
                    data: encrypted,
                    checksum,
                    row_count,
                })
            })
            .collect();

        let mut payloads = Vec::with_capacity(results.len());
        for result in results {
            payloads.push(result?);
        }

        // Serial append in schema order; offsets are only known here. Block
        // entries are staged so a failed or cancelled append never leaks
        // into the directory.
        let mut staged: Vec<BlockInfo> = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            cancel.check()?;
            let offset = self.file.append(&payload.data)?;
            staged.push(BlockInfo {
                column_name: payload.name.clone(),
                offset,
                length: payload.data.len() as u64,
                row_count: payload.row_count,
                compressed: false,
                checksum: payload.checksum.clone(),
                orig_size: None,
                mime_type: None,
            });
            log::debug!(
                "wrote encrypted column block {} at offset {} ({} bytes)",
                payload.name,
                offset,
                payload.data.len()
            );
        }

        let metadata = self.file.metadata_mut();
        metadata.block_info.extend(staged);
        metadata.log_access(
            "system",
            "write",
            "record",
            true,
            &format!("wrote {row_count} rows"),
        );
        metadata.touch("system");

        self.file.update_metadata()
    }
}

/// The batch must conform to the file schema by field index: same field
/// count, names, and types.
fn check_batch_shape(schema: &Schema, batch: &RecordBatch) -> Result<()> {
    let batch_schema = batch.schema();
    if batch_schema.fields().len() != schema.fields().len() {
        return Err(LockboxError::ShapeMismatch(format!(
            "expected {} columns, got {}",
            schema.fields().len(),
            batch_schema.fields().len()
        )));
    }
    for (i, field) in schema.fields().iter().enumerate() {
        let actual = batch_schema.field(i);
        if actual.name() != field.name() {
            return Err(LockboxError::ShapeMismatch(format!(
                "field name mismatch at index {i}: expected {}, got {}",
                field.name(),
                actual.name()
            )));
        }
        if actual.data_type() != field.data_type() {
            return Err(LockboxError::ShapeMismatch(format!(
                "incompatible type for field {}: expected {}, got {}",
                field.name(),
                field.data_type(),
                actual.data_type()
            )));
        }
    }
    Ok(())
}

/// Serialize one column as a single-record, one-field Arrow IPC stream.
fn serialize_column(field: &FieldRef, column: &ArrayRef, row_count: u64) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![field.as_ref().clone()]));
    let single = RecordBatch::try_new(schema.clone(), vec![column.clone()])?;
    debug_assert_eq!(single.num_rows() as u64, row_count);

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema)?;
        writer.write(&single)?;
        writer.finish()?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use tempfile::tempdir;

    fn test_schema() -> arrow::datatypes::SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    fn test_batch() -> RecordBatch {
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("Alice"), Some("Bob")])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_write_appends_blocks_in_schema_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        let mut file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();

        let mut writer = file.writer("pw").unwrap();
        writer
            .write_record(&test_batch(), None, &CancellationToken::new())
            .unwrap();

        let blocks = &file.metadata().block_info;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].column_name, "id");
        assert_eq!(blocks[1].column_name, "name");
        assert!(blocks[1].offset > blocks[0].offset);
        assert_eq!(blocks[0].row_count, 2);
        assert_eq!(blocks[0].checksum.len(), 32);
        assert_eq!(file.metadata().audit_trail.access_log.len(), 1);
    }

    #[test]
    fn test_write_rejects_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        let mut file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();

        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)])),
            vec![Arc::new(Int64Array::from(vec![1])) as ArrayRef],
        )
        .unwrap();

        let mut writer = file.writer("pw").unwrap();
        let err = writer
            .write_record(&other, None, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, LockboxError::ShapeMismatch(_)));
        assert!(file.metadata().block_info.is_empty());
    }

    #[test]
    fn test_cancelled_write_leaves_directory_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        let mut file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let mut writer = file.writer("pw").unwrap();
        let err = writer
            .write_record(&test_batch(), None, &token)
            .unwrap_err();
        assert!(matches!(err, LockboxError::Cancelled));
        assert!(file.metadata().block_info.is_empty());
    }

    #[test]
    fn test_write_unknown_column_filter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        let mut file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();

        let mut writer = file.writer("pw").unwrap();
        let err = writer
            .write_record(
                &test_batch(),
                Some(&["missing".to_string()]),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, LockboxError::ColumnNotFound(_)));
    }
}
