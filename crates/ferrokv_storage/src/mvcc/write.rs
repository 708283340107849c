//! Committed version records stored in the write column family under
//! `key + !commit_ts`.
//!
//! ```text
//!   [kind: u8][start_ts: u64][has_short: u8][value_len: u32][value]
//! ```

use ferrokv_common::error::MvccError;
use ferrokv_common::Timestamp;

use super::lock::LockKind;
use super::{read_bytes, read_u64, read_u8};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Put,
    Delete,
    /// Commit of a `Lock` mutation; carries no data and readers skip it.
    Lock,
}

impl WriteKind {
    pub fn from_lock_kind(kind: LockKind) -> Self {
        match kind {
            LockKind::Put => WriteKind::Put,
            LockKind::Delete => WriteKind::Delete,
            LockKind::Lock => WriteKind::Lock,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            WriteKind::Put => b'P',
            WriteKind::Delete => b'D',
            WriteKind::Lock => b'L',
        }
    }

    fn from_byte(b: u8) -> Result<Self, MvccError> {
        match b {
            b'P' => Ok(WriteKind::Put),
            b'D' => Ok(WriteKind::Delete),
            b'L' => Ok(WriteKind::Lock),
            other => Err(MvccError::Corrupted(format!("bad write kind {:#x}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub kind: WriteKind,
    pub start_ts: Timestamp,
    pub short_value: Option<Vec<u8>>,
}

impl Write {
    pub fn new(kind: WriteKind, start_ts: Timestamp, short_value: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            start_ts,
            short_value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 + self.short_value.as_ref().map_or(0, |v| v.len()));
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&self.start_ts.to_le_bytes());
        match &self.short_value {
            Some(v) => {
                buf.push(1);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v);
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MvccError> {
        let mut pos = 0;
        let kind = WriteKind::from_byte(read_u8(buf, &mut pos)?)?;
        let start_ts = read_u64(buf, &mut pos)?;
        let short_value = match read_u8(buf, &mut pos)? {
            0 => None,
            _ => Some(read_bytes(buf, &mut pos)?),
        };
        Ok(Self {
            kind,
            start_ts,
            short_value,
        })
    }
}
