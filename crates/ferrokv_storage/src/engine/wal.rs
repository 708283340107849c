//! Write-ahead log for the engine.
//!
//! Every committed [`WriteBatch`] is appended as one record before it is
//! applied to the in-memory column families. On open, the log is replayed in
//! order to rebuild the engine state.
//!
//! File layout:
//! ```text
//!   [magic "FKVW":4][format version:4]
//!   [len:4][crc32:4][bincode(WriteBatch):len]
//!   [len:4][crc32:4][bincode(WriteBatch):len]
//!   ...
//! ```
//! Replay stops at the first truncated or corrupt record, and the file is
//! cut back to the end of the last intact record before new appends.
//!
//! A checkpoint replaces the whole log with the live contents of the engine:
//! the records go to `engine.wal.tmp`, which is synced and renamed over the
//! active log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ferrokv_common::error::EngineError;

use super::WriteBatch;

pub const WAL_MAGIC: &[u8; 4] = b"FKVW";
pub const WAL_FORMAT_VERSION: u32 = 1;
const WAL_HEADER_SIZE: usize = 8;
const WAL_FILE_NAME: &str = "engine.wal";
const WAL_TMP_FILE_NAME: &str = "engine.wal.tmp";

/// Result of reading a log: the intact batches and the byte length they
/// span, header included.
#[derive(Debug, Default)]
pub struct WalReplay {
    pub batches: Vec<WriteBatch>,
    pub valid_len: u64,
}

pub struct EngineWal {
    writer: BufWriter<File>,
    dir: PathBuf,
    path: PathBuf,
    sync: bool,
    size: u64,
}

impl EngineWal {
    /// Open the log in `dir`, dropping any torn tail.
    pub fn open(dir: &Path, sync: bool) -> Result<Self, EngineError> {
        let replay = Self::read_all(dir)?;
        Self::open_at(dir, sync, replay.valid_len)
    }

    /// Open the log for appending after its first `valid_len` bytes.
    /// Anything past that offset is truncated.
    pub fn open_at(dir: &Path, sync: bool, valid_len: u64) -> Result<Self, EngineError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                on_disk,
                valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;
        let mut wal = Self {
            writer: BufWriter::new(file),
            dir: dir.to_path_buf(),
            path,
            sync,
            size: valid_len,
        };
        if valid_len == 0 {
            wal.write_header()?;
        }
        Ok(wal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current log length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn write_header(&mut self) -> Result<(), EngineError> {
        self.writer.write_all(WAL_MAGIC)?;
        self.writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        self.writer.flush()?;
        self.size = WAL_HEADER_SIZE as u64;
        Ok(())
    }

    /// Append one batch. The record is flushed to the OS before returning,
    /// and fsynced when the log was opened with `sync`.
    pub fn append(&mut self, batch: &WriteBatch) -> Result<(), EngineError> {
        self.size += write_record(&mut self.writer, batch)?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replace the log with `batches`, returning the new log size.
    pub fn rewrite<I>(&mut self, batches: I) -> Result<u64, EngineError>
    where
        I: IntoIterator<Item = WriteBatch>,
    {
        let tmp = self.dir.join(WAL_TMP_FILE_NAME);
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(WAL_MAGIC)?;
        out.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        let mut size = WAL_HEADER_SIZE as u64;
        for batch in batches {
            size += write_record(&mut out, &batch)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&tmp, &self.path)?;
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.size = size;
        Ok(size)
    }

    /// Read every intact batch from the log in `dir`.
    pub fn read_all(dir: &Path) -> Result<WalReplay, EngineError> {
        let path = dir.join(WAL_FILE_NAME);
        if !path.exists() {
            return Ok(WalReplay::default());
        }
        let data = fs::read(&path)?;
        if data.len() < WAL_HEADER_SIZE {
            // Crash while the header was being written.
            let mut header = WAL_MAGIC.to_vec();
            header.extend_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
            if header.starts_with(&data) {
                return Ok(WalReplay::default());
            }
        }
        if data.len() < WAL_HEADER_SIZE || &data[0..4] != WAL_MAGIC.as_slice() {
            return Err(EngineError::Corruption(format!(
                "bad WAL header in {}",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != WAL_FORMAT_VERSION {
            return Err(EngineError::Corruption(format!(
                "unsupported WAL format version {}",
                version
            )));
        }
        let (batches, consumed) = parse_records(&data[WAL_HEADER_SIZE..]);
        Ok(WalReplay {
            batches,
            valid_len: (WAL_HEADER_SIZE + consumed) as u64,
        })
    }
}

fn write_record<W: Write>(out: &mut W, batch: &WriteBatch) -> Result<u64, EngineError> {
    let data = bincode::serialize(batch).map_err(|e| EngineError::Serialization(e.to_string()))?;
    let checksum = crc32fast::hash(&data);
    out.write_all(&(data.len() as u32).to_le_bytes())?;
    out.write_all(&checksum.to_le_bytes())?;
    out.write_all(&data)?;
    Ok(8 + data.len() as u64)
}

/// Decode records until the first bad one. Returns the batches and the
/// number of bytes they occupy.
fn parse_records(data: &[u8]) -> (Vec<WriteBatch>, usize) {
    let mut batches = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let body = pos + 8;

        if body + len > data.len() {
            tracing::warn!("WAL truncated at position {}, stopping replay", pos);
            break;
        }
        let record = &data[body..body + len];
        if crc32fast::hash(record) != checksum {
            tracing::warn!("WAL checksum mismatch at position {}, stopping replay", pos);
            break;
        }
        match bincode::deserialize::<WriteBatch>(record) {
            Ok(batch) => batches.push(batch),
            Err(e) => {
                tracing::warn!("WAL decode error at position {}: {}", pos, e);
                break;
            }
        }
        pos = body + len;
    }
    if pos < data.len() {
        tracing::warn!(dropped = data.len() - pos, "WAL has a torn tail");
    }
    (batches, pos)
}
