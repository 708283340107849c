//! Multi-version concurrency control over the engine's column families.
//!
//! ```text
//!   lock   CF   z + enc(key)               -> Lock     (at most one per key)
//!   write  CF   z + enc(key) + !commit_ts  -> Write    (append-only history)
//!   default CF  z + enc(key) + !start_ts   -> value    (values > 255 bytes)
//! ```
//!
//! Prewrite installs locks, Commit turns them into write records, Rollback
//! deletes them. All three run under the key latches (see [`latch`]).

pub mod codec;
pub mod latch;
pub mod lock;
pub mod reader;
pub mod scanner;
pub mod store;
pub mod write;

use ferrokv_common::error::MvccError;

pub use codec::Key;
pub use latch::{LatchGuard, Latches};
pub use lock::{Lock, LockKind};
pub use reader::MvccReader;
pub use scanner::MvccScanner;
pub use store::MvccStore;
pub use write::{Write, WriteKind};

/// Values up to this length are inlined into the lock and write records.
pub const SHORT_VALUE_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put,
    Del,
    Lock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Del,
            key: key.into(),
            value: Vec::new(),
        }
    }

    pub fn lock(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Lock,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// Result unit of batched reads: exactly one of a value or an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub result: Result<Vec<u8>, MvccError>,
}

fn truncated(what: &str, pos: usize) -> MvccError {
    MvccError::Corrupted(format!("record truncated reading {} at {}", what, pos))
}

pub(crate) fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, MvccError> {
    let b = *buf.get(*pos).ok_or_else(|| truncated("u8", *pos))?;
    *pos += 1;
    Ok(b)
}

pub(crate) fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, MvccError> {
    let bytes = buf.get(*pos..*pos + 8).ok_or_else(|| truncated("u64", *pos))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    *pos += 8;
    Ok(u64::from_le_bytes(arr))
}

pub(crate) fn read_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, MvccError> {
    let len_bytes = buf.get(*pos..*pos + 4).ok_or_else(|| truncated("length", *pos))?;
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    *pos += 4;
    let data = buf.get(*pos..*pos + len).ok_or_else(|| truncated("bytes", *pos))?;
    *pos += len;
    Ok(data.to_vec())
}
