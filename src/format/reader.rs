//! Parallel column read pipeline
//!
//! For a projection, the reader locates each column's directory blocks and
//! drives positional read -> checksum verify -> decrypt -> IPC decode
//! concurrently across columns. Multiple blocks for one column are a
//! logical append: their arrays are concatenated in directory order, so a
//! later write extends the column instead of orphaning its payload.

use super::{CancellationToken, LockboxFile};
use crate::crypto::ColumnCipher;
use crate::metadata::BlockInfo;
use crate::{LockboxError, Result};
use arrow::array::ArrayRef;
use arrow::compute::concat;
use arrow::datatypes::{FieldRef, Schema};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// Reads and decrypts column batches from a lockbox file.
pub struct Reader<'a> {
    file: &'a mut LockboxFile,
    ciphers: HashMap<String, ColumnCipher>,
}

impl LockboxFile {
    /// Create a reader, deriving the master key and every column key up front.
    pub fn reader(&mut self, password: &str) -> Result<Reader<'_>> {
        let ciphers = super::writer::column_ciphers(self, password)?;
        Ok(Reader {
            file: self,
            ciphers,
        })
    }
}

impl Reader<'_> {
    /// Read the projected columns into a single record batch.
    ///
    /// An empty projection selects every schema field. The result batch
    /// carries the projected fields in projection order; all assembled
    /// columns must agree on the row count (directory counts are advisory).
    pub fn read_record(
        &mut self,
        projection: &[String],
        cancel: &CancellationToken,
    ) -> Result<RecordBatch> {
        let schema = self.file.schema();

        // Resolve the target fields in projection order
        let mut targets: Vec<(FieldRef, Vec<BlockInfo>)> = Vec::new();
        let fields: Vec<FieldRef> = if projection.is_empty() {
            schema.fields().iter().cloned().collect()
        } else {
            let mut resolved = Vec::with_capacity(projection.len());
            for name in projection {
                let index = schema
                    .index_of(name)
                    .map_err(|_| LockboxError::ColumnNotFound(name.clone()))?;
                resolved.push(schema.fields()[index].clone());
            }
            resolved
        };

        for field in fields {
            let blocks: Vec<BlockInfo> = self
                .file
                .metadata()
                .blocks_for_column(field.name())
                .into_iter()
                .cloned()
                .collect();
            if blocks.is_empty() {
                return Err(LockboxError::ColumnNotFound(field.name().clone()));
            }
            targets.push((field, blocks));
        }

        // Decrypt every column concurrently; positional reads never touch
        // the shared cursor. Collect preserves projection order, so the
        // first error wins by order and partial arrays are dropped with the
        // result vector.
        let file: &LockboxFile = self.file;
        let ciphers = &self.ciphers;
        let results: Vec<Result<ArrayRef>> = targets
            .par_iter()
            .map(|(field, blocks)| {
                cancel.check()?;

                let mut parts: Vec<ArrayRef> = Vec::with_capacity(blocks.len());
                for block in blocks {
                    let data = file.read_block_at(block.offset, block.length)?;

                    let sum = Sha256::digest(&data);
                    if sum.as_slice() != block.checksum.as_slice() {
                        return Err(LockboxError::ChecksumMismatch(field.name().clone()));
                    }

                    let cipher = ciphers
                        .get(field.name())
                        .ok_or_else(|| LockboxError::ColumnNotFound(field.name().clone()))?;
                    let plain = cipher.decrypt(&data)?;
                    parts.push(deserialize_column(&plain, field)?);
                }

                log::debug!(
                    "read and decrypted column {} ({} blocks)",
                    field.name(),
                    parts.len()
                );
                if parts.len() == 1 {
                    Ok(parts.pop().unwrap())
                } else {
                    let refs: Vec<&dyn arrow::array::Array> =
                        parts.iter().map(|a| a.as_ref()).collect();
                    Ok(concat(&refs)?)
                }
            })
            .collect();

        let mut arrays = Vec::with_capacity(results.len());
        for result in results {
            arrays.push(result?);
        }

        let row_count = arrays.first().map(|a| a.len()).unwrap_or(0);
        if arrays.iter().any(|a| a.len() != row_count) {
            return Err(LockboxError::ShapeMismatch(
                "assembled columns disagree on row count".to_string(),
            ));
        }

        let out_fields: Vec<FieldRef> = targets.iter().map(|(f, _)| f.clone()).collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(out_fields)), arrays)?;

        self.file.metadata_mut().log_access(
            "system",
            "read",
            "record",
            true,
            &format!("read {row_count} rows"),
        );

        Ok(batch)
    }
}

/// Decode a one-field single-record IPC stream, checking it against the
/// field the directory claims it holds.
fn deserialize_column(data: &[u8], expected: &FieldRef) -> Result<ArrayRef> {
    let mut reader = StreamReader::try_new(Cursor::new(data), None)?;
    let batch = reader
        .next()
        .ok_or_else(|| {
            LockboxError::InvalidFileFormat(format!(
                "empty column stream for {}",
                expected.name()
            ))
        })??;

    if batch.num_columns() != 1 {
        return Err(LockboxError::InvalidFileFormat(format!(
            "expected one column in block stream, got {}",
            batch.num_columns()
        )));
    }
    let field = batch.schema().field(0).clone();
    if field.name() != expected.name() || field.data_type() != expected.data_type() {
        return Err(LockboxError::InvalidFileFormat(format!(
            "block stream holds {} ({}), directory claims {} ({})",
            field.name(),
            field.data_type(),
            expected.name(),
            expected.data_type()
        )));
    }

    Ok(batch.column(0).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, SchemaRef};
    use tempfile::tempdir;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
        ]))
    }

    fn test_batch() -> RecordBatch {
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![
                    Some("alice"),
                    Some("bob"),
                    Some("carol"),
                ])),
                Arc::new(Float64Array::from(vec![10.0, 55.0, 30.0])),
            ],
        )
        .unwrap()
    }

    fn written_file(dir: &tempfile::TempDir) -> LockboxFile {
        let path = dir.path().join("test.lbx");
        let mut file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();
        file.writer("pw")
            .unwrap()
            .write_record(&test_batch(), None, &CancellationToken::new())
            .unwrap();
        file
    }

    #[test]
    fn test_read_all_columns() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);

        let batch = file
            .reader("pw")
            .unwrap()
            .read_record(&[], &CancellationToken::new())
            .unwrap();

        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 3);
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.values(), &[1, 2, 3]);
    }

    #[test]
    fn test_projection_order_is_preserved() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);

        let batch = file
            .reader("pw")
            .unwrap()
            .read_record(
                &["score".to_string(), "id".to_string()],
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(batch.num_columns(), 2);
        assert_eq!(batch.schema().field(0).name(), "score");
        assert_eq!(batch.schema().field(1).name(), "id");
        assert_eq!(batch.num_rows(), 3);
    }

    #[test]
    fn test_unknown_projection_column() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);

        let err = file
            .reader("pw")
            .unwrap()
            .read_record(&["missing".to_string()], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, LockboxError::ColumnNotFound(name) if name == "missing"));
    }

    #[test]
    fn test_wrong_password_is_auth_failure() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);

        let err = file
            .reader("wrong")
            .unwrap()
            .read_record(&[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, LockboxError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_second_write_extends_columns() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);

        let more = RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(vec![4])),
                Arc::new(StringArray::from(vec![Some("dave")])),
                Arc::new(Float64Array::from(vec![70.0])),
            ],
        )
        .unwrap();
        file.writer("pw")
            .unwrap()
            .write_record(&more, None, &CancellationToken::new())
            .unwrap();

        let batch = file
            .reader("pw")
            .unwrap()
            .read_record(&[], &CancellationToken::new())
            .unwrap();
        assert_eq!(batch.num_rows(), 4);
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.values(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_tampered_block_is_checksum_mismatch() {
        let dir = tempdir().unwrap();
        let mut file = written_file(&dir);
        let path = file.path().to_path_buf();
        let offset = file.metadata().block_info[0].offset;
        file.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[offset as usize + 5] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut file = LockboxFile::open(&path, "pw").unwrap();
        let err = file
            .reader("pw")
            .unwrap()
            .read_record(&[], &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, LockboxError::ChecksumMismatch(name) if name == "id"));
    }
}
