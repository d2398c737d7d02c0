//! Lockbox file layout
//!
//! On disk: a fixed 28-byte header (magic, version, flags, reserved,
//! metadata offset — all little-endian), followed by encrypted column
//! blocks, followed by a length-prefixed JSON metadata trailer. The header's
//! metadata-offset slot always points at the most recent trailer; stale
//! trailers left behind by earlier rewrites are simply unreferenced bytes.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use crate::metadata::{Metadata, FORMAT_VERSION, MAGIC};
use crate::{LockboxError, Result};
use arrow::datatypes::SchemaRef;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Total header size: magic(8) + version(4) + flags(4) + reserved(4) + offset(8)
pub const HEADER_SIZE: usize = 28;
/// Byte position of the metadata-offset slot inside the header
pub const METADATA_OFFSET_POS: u64 = 20;

/// Cooperative cancellation signal for the write/read pipelines.
///
/// Observed at bounded checkpoints: a cancelled operation lets in-flight
/// column workers finish, then returns [`LockboxError::Cancelled`] without
/// rewriting the trailer, so any partially appended bytes stay unreferenced.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(LockboxError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// An open lockbox file handle.
///
/// Only one write or read may be in flight at a time; the `&mut self`
/// receivers enforce this at compile time. Within a read, workers issue
/// concurrent positional reads that never touch the shared cursor.
pub struct LockboxFile {
    file: File,
    metadata: Metadata,
    path: PathBuf,
    readonly: bool,
}

impl LockboxFile {
    /// Create a new lockbox file with the given schema.
    ///
    /// Writes the header with a zeroed metadata offset, then the initial
    /// empty-directory trailer; the file is openable from the moment the
    /// first trailer write completes.
    pub fn create(
        path: impl AsRef<Path>,
        schema: SchemaRef,
        password: &str,
        created_by: &str,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if password.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "password is required".to_string(),
            ));
        }

        let master_key = crate::crypto::MasterKey::generate(password)?;
        let metadata = Metadata::new(schema, &master_key.salt, created_by)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut lbf = Self {
            file,
            metadata,
            path: path.clone(),
            readonly: false,
        };

        if let Err(e) = lbf.write_header().and_then(|_| lbf.update_metadata()) {
            drop(lbf);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        log::info!("created lockbox file {}", path.display());
        Ok(lbf)
    }

    /// Open an existing lockbox file.
    ///
    /// Validates the container format only; a wrong password surfaces as an
    /// authentication failure on the first block decryption.
    pub fn open(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if password.is_empty() {
            return Err(LockboxError::InvalidArgument(
                "password is required".to_string(),
            ));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let metadata = read_trailer(&mut file)?;

        log::info!("opened lockbox file {}", path.display());
        Ok(Self {
            file,
            metadata,
            path,
            readonly: false,
        })
    }

    /// Flush and release the underlying handle.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn schema(&self) -> SchemaRef {
        self.metadata.schema.clone()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Positional read of one block's encrypted bytes.
    pub(crate) fn read_block_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    /// Append raw bytes at end-of-file, returning their start offset.
    pub(crate) fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    /// Write the fixed header with a zeroed metadata offset.
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(MAGIC)?;
        self.file.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        self.file.write_u32::<LittleEndian>(0)?; // flags
        self.file.write_u32::<LittleEndian>(0)?; // reserved
        self.file.write_u64::<LittleEndian>(0)?; // metadata offset placeholder
        Ok(())
    }

    /// Rewrite the metadata trailer at end-of-file and point the header's
    /// offset slot at it. The previous trailer becomes unreferenced.
    pub(crate) fn update_metadata(&mut self) -> Result<()> {
        if self.readonly {
            return Err(LockboxError::InvalidArgument(
                "file is read-only".to_string(),
            ));
        }

        let trailer_pos = self.file.seek(SeekFrom::End(0))?;
        let bytes = self.metadata.serialize()?;

        self.file.write_u32::<LittleEndian>(bytes.len() as u32)?;
        self.file.write_all(&bytes)?;

        self.file.seek(SeekFrom::Start(METADATA_OFFSET_POS))?;
        self.file.write_u64::<LittleEndian>(trailer_pos)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Recompute and verify the checksum of every directory block.
    /// Does not decrypt.
    pub fn validate_blocks(&self) -> Result<()> {
        for block in &self.metadata.block_info {
            let data = self.read_block_at(block.offset, block.length)?;
            let sum = Sha256::digest(&data);
            if sum.as_slice() != block.checksum.as_slice() {
                return Err(LockboxError::ChecksumMismatch(block.column_name.clone()));
            }
        }
        Ok(())
    }

    /// Drop directory entries whose blocks no longer verify and rewrite the
    /// trailer. Block bytes are never truncated; dropped blocks simply
    /// become unreferenced space.
    pub fn repair(&mut self) -> Result<()> {
        let mut valid = Vec::with_capacity(self.metadata.block_info.len());
        for block in &self.metadata.block_info {
            let data = match self.read_block_at(block.offset, block.length) {
                Ok(data) => data,
                Err(_) => continue,
            };
            let sum = Sha256::digest(&data);
            if sum.as_slice() == block.checksum.as_slice() {
                valid.push(block.clone());
            } else {
                log::info!("repair: dropping corrupted block for column {}", block.column_name);
            }
        }
        self.metadata.block_info = valid;
        self.update_metadata()
    }
}

/// Read and validate the header, then the trailer it points at.
fn read_trailer(file: &mut File) -> Result<Metadata> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_bytes).map_err(|_| {
        LockboxError::InvalidFileFormat("file too short for header".to_string())
    })?;

    let mut cursor = Cursor::new(&header_bytes[..]);
    let mut magic = [0u8; 8];
    cursor.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(LockboxError::InvalidFileFormat(
            "invalid magic bytes".to_string(),
        ));
    }

    let version = cursor.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(LockboxError::VersionMismatch {
            expected: FORMAT_VERSION,
            actual: version,
        });
    }
    let _flags = cursor.read_u32::<LittleEndian>()?;
    let _reserved = cursor.read_u32::<LittleEndian>()?;

    let metadata_offset = cursor.read_u64::<LittleEndian>()?;
    if metadata_offset == 0 {
        return Err(LockboxError::InvalidFileFormat(
            "file has no metadata trailer".to_string(),
        ));
    }

    file.seek(SeekFrom::Start(metadata_offset))?;
    let trailer_len = file.read_u32::<LittleEndian>().map_err(|_| {
        LockboxError::InvalidFileFormat("truncated metadata trailer".to_string())
    })?;

    let mut trailer = vec![0u8; trailer_len as usize];
    file.read_exact(&mut trailer).map_err(|_| {
        LockboxError::InvalidFileFormat("truncated metadata trailer".to_string())
    })?;

    Metadata::deserialize(&trailer)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill buffer",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");

        {
            let file = LockboxFile::create(&path, test_schema(), "pw", "tester").unwrap();
            assert_eq!(file.metadata().header.version, FORMAT_VERSION);
            file.close().unwrap();
        }

        let file = LockboxFile::open(&path, "pw").unwrap();
        assert_eq!(file.schema().fields().len(), 2);
        assert_eq!(file.metadata().audit_trail.created_by, "tester");
        assert!(file.metadata().block_info.is_empty());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        LockboxFile::create(&path, test_schema(), "pw", "tester")
            .unwrap()
            .close()
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            LockboxFile::open(&path, "pw"),
            Err(LockboxError::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_open_rejects_unknown_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        LockboxFile::create(&path, test_schema(), "pw", "tester")
            .unwrap()
            .close()
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8] = 99;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            LockboxFile::open(&path, "pw"),
            Err(LockboxError::VersionMismatch { actual: 99, .. })
        ));
    }

    #[test]
    fn test_open_rejects_zero_metadata_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        LockboxFile::create(&path, test_schema(), "pw", "tester")
            .unwrap()
            .close()
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        for b in &mut bytes[METADATA_OFFSET_POS as usize..HEADER_SIZE] {
            *b = 0;
        }
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            LockboxFile::open(&path, "pw"),
            Err(LockboxError::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_create_requires_password() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lbx");
        assert!(matches!(
            LockboxFile::create(&path, test_schema(), "", "tester"),
            Err(LockboxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(LockboxError::Cancelled)));
    }
}
