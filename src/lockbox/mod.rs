//! High-level lockbox operations
//!
//! [`Lockbox`] wraps a [`LockboxFile`] and exposes the public surface:
//! create/open/close, encrypted batch write and projected read, the
//! restricted SQL query operator, file info, and integrity operations.


use crate::format::{CancellationToken, LockboxFile};
use crate::metadata::Metadata;
use crate::query::{self, SelectItem};
use crate::Result;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Options for a write operation
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Restrict writing to these columns; empty means all columns
    pub columns: Vec<String>,
    pub cancel: CancellationToken,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Options for a read operation
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Projection in output order; empty means all columns
    pub columns: Vec<String>,
    pub cancel: CancellationToken,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Summary information about a lockbox file
#[derive(Debug, Clone)]
pub struct Info {
    pub version: u32,
    pub schema: SchemaRef,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,
    pub block_count: usize,
    pub access_count: usize,
}

/// A lockbox file with high-level operations
pub struct Lockbox {
    file: LockboxFile,
}

impl Lockbox {
    /// Create a new lockbox file with the given schema.
    pub fn create(
        path: impl AsRef<Path>,
        schema: SchemaRef,
        password: &str,
        created_by: &str,
    ) -> Result<Self> {
        let file = LockboxFile::create(path, schema, password, created_by)?;
        Ok(Self { file })
    }

    /// Open an existing lockbox file.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let file = LockboxFile::open(path, password)?;
        Ok(Self { file })
    }

    /// Flush and release the underlying file handle.
    pub fn close(self) -> Result<()> {
        self.file.close()
    }

    pub fn schema(&self) -> SchemaRef {
        self.file.schema()
    }

    pub fn metadata(&self) -> &Metadata {
        self.file.metadata()
    }

    /// Write a record batch, encrypting every column.
    pub fn write(&mut self, batch: &RecordBatch, password: &str) -> Result<()> {
        self.write_with(batch, password, &WriteOptions::default())
    }

    /// Write a record batch with explicit options.
    pub fn write_with(
        &mut self,
        batch: &RecordBatch,
        password: &str,
        options: &WriteOptions,
    ) -> Result<()> {
        let columns = if options.columns.is_empty() {
            None
        } else {
            Some(options.columns.as_slice())
        };
        let mut writer = self.file.writer(password)?;
        writer.write_record(batch, columns, &options.cancel)?;
        log::debug!(
            "wrote {} rows across {} columns",
            batch.num_rows(),
            batch.num_columns()
        );
        Ok(())
    }

    /// Read every column into a single record batch.
    pub fn read(&mut self, password: &str) -> Result<RecordBatch> {
        self.read_with(password, &ReadOptions::default())
    }

    /// Read a projection of columns, in projection order.
    pub fn read_columns(&mut self, password: &str, columns: &[&str]) -> Result<RecordBatch> {
        self.read_with(password, &ReadOptions::new().with_columns(columns))
    }

    /// Read with explicit options.
    pub fn read_with(&mut self, password: &str, options: &ReadOptions) -> Result<RecordBatch> {
        let mut reader = self.file.reader(password)?;
        let batch = reader.read_record(&options.columns, &options.cancel)?;
        log::debug!(
            "read {} rows across {} columns",
            batch.num_rows(),
            batch.num_columns()
        );
        Ok(batch)
    }

    /// Run a restricted SELECT over the file, reading only the columns the
    /// statement touches.
    pub fn query(&mut self, sql: &str, password: &str) -> Result<RecordBatch> {
        let stmt = query::parse(sql)?;

        // Projection pushdown: projected columns, then WHERE and ORDER BY
        // columns. SELECT * (and a bare COUNT(*)) reads everything.
        fn push(required: &mut Vec<String>, name: &str) {
            if !required.iter().any(|c| c == name) {
                required.push(name.to_string());
            }
        }

        let mut select_all = false;
        let mut required: Vec<String> = Vec::new();
        for item in &stmt.items {
            match item {
                SelectItem::All => select_all = true,
                SelectItem::Column(name) => push(&mut required, name),
                SelectItem::Aggregate {
                    column: Some(name), ..
                } => push(&mut required, name),
                SelectItem::Aggregate { column: None, .. } => {}
            }
        }
        if let Some(clause) = &stmt.where_clause {
            push(&mut required, &clause.column);
        }
        if let Some(order) = &stmt.order_by {
            push(&mut required, &order.column);
        }
        if select_all || required.is_empty() {
            required.clear();
        }

        let mut reader = self.file.reader(password)?;
        let batch = reader.read_record(&required, &CancellationToken::new())?;
        let result = query::execute(&batch, &stmt)?;

        log::debug!("query returned {} rows: {}", result.num_rows(), sql);
        Ok(result)
    }

    /// File summary: format version, schema, audit fields, block and access
    /// counts.
    pub fn info(&self) -> Info {
        let meta = self.file.metadata();
        Info {
            version: meta.header.version,
            schema: meta.schema.clone(),
            created_at: meta.audit_trail.created_at,
            created_by: meta.audit_trail.created_by.clone(),
            modified_at: meta.audit_trail.modified_at,
            modified_by: meta.audit_trail.modified_by.clone(),
            block_count: meta.block_info.len(),
            access_count: meta.audit_trail.access_log.len(),
        }
    }

    /// Verify the checksum of every data block.
    pub fn validate(&self) -> Result<()> {
        self.file.validate_blocks()
    }

    /// Drop corrupted blocks from the directory and rewrite the trailer.
    pub fn repair(&mut self) -> Result<()> {
        self.file.repair()
    }
}

impl std::fmt::Debug for Lockbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockbox")
            .field("path", &self.file.path())
            .field("blocks", &self.file.metadata().block_info.len())
            .finish()
    }
}
