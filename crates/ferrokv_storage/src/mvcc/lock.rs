//! Lock records stored in the lock column family.
//!
//! ## Wire format (little-endian)
//!
//! ```text
//!   [kind: u8]              'P' put, 'D' delete, 'L' lock
//!   [start_ts: u64]
//!   [ttl: u64]
//!   [primary_len: u32][primary]
//!   [has_short: u8][value_len: u32][value]   (value only when has_short = 1)
//! ```

use ferrokv_common::error::MvccError;
use ferrokv_common::{LockInfo, Timestamp};

use super::{read_bytes, read_u64, read_u8};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Put,
    Delete,
    Lock,
}

impl LockKind {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            LockKind::Put => b'P',
            LockKind::Delete => b'D',
            LockKind::Lock => b'L',
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self, MvccError> {
        match b {
            b'P' => Ok(LockKind::Put),
            b'D' => Ok(LockKind::Delete),
            b'L' => Ok(LockKind::Lock),
            other => Err(MvccError::Corrupted(format!("bad lock kind {:#x}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub kind: LockKind,
    pub primary: Vec<u8>,
    pub start_ts: Timestamp,
    pub ttl: u64,
    /// Inline value; `None` for long values kept in the default CF.
    pub short_value: Option<Vec<u8>>,
}

impl Lock {
    pub fn new(
        kind: LockKind,
        primary: Vec<u8>,
        start_ts: Timestamp,
        ttl: u64,
        short_value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            kind,
            primary,
            start_ts,
            ttl,
            short_value,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let value_len = self.short_value.as_ref().map_or(0, |v| v.len());
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 4 + self.primary.len() + 1 + 4 + value_len);
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&self.start_ts.to_le_bytes());
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&(self.primary.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.primary);
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
        let kind = LockKind::from_byte(read_u8(buf, &mut pos)?)?;
        let start_ts = read_u64(buf, &mut pos)?;
        let ttl = read_u64(buf, &mut pos)?;
        let primary = read_bytes(buf, &mut pos)?;
        let short_value = match read_u8(buf, &mut pos)? {
            0 => None,
            _ => Some(read_bytes(buf, &mut pos)?),
        };
        Ok(Self {
            kind,
            primary,
            start_ts,
            ttl,
            short_value,
        })
    }

    pub fn to_lock_info(&self, raw_key: Vec<u8>) -> LockInfo {
        LockInfo {
            key: raw_key,
            primary_lock: self.primary.clone(),
            lock_version: self.start_ts,
            lock_ttl: self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_with_short_value() {
        let lock = Lock::new(LockKind::Put, b"pk".to_vec(), 10, 3000, Some(b"v1".to_vec()));
        let parsed = Lock::parse(&lock.to_bytes()).unwrap();
        assert_eq!(parsed, lock);
    }

    #[test]
    fn test_delete_lock_without_value() {
        let lock = Lock::new(LockKind::Delete, b"pk".to_vec(), 7, 0, None);
        let bytes = lock.to_bytes();
        assert_eq!(bytes[0], b'D');
        assert_eq!(Lock::parse(&bytes).unwrap().short_value, None);
    }

    #[test]
    fn test_parse_rejects_truncated_and_bad_kind() {
        let bytes = Lock::new(LockKind::Lock, b"p".to_vec(), 1, 1, None).to_bytes();
        assert!(Lock::parse(&bytes[..bytes.len() - 2]).is_err());
        let mut bad = bytes.clone();
        bad[0] = b'?';
        assert!(Lock::parse(&bad).is_err());
    }

    #[test]
    fn test_to_lock_info() {
        let lock = Lock::new(LockKind::Put, b"pk".to_vec(), 10, 3000, None);
        let info = lock.to_lock_info(b"k".to_vec());
        assert_eq!(info.lock_version, 10);
        assert_eq!(info.primary_lock, b"pk".to_vec());
        assert_eq!(info.lock_ttl, 3000);
    }
}
