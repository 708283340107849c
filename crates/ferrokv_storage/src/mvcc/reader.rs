//! Snapshot reader implementing the per-key visibility rule.

use ferrokv_common::error::MvccError;
use ferrokv_common::types::MAX_TS;
use ferrokv_common::Timestamp;

use super::codec::{decode_ts_from, Key};
use super::lock::Lock;
use super::write::{Write, WriteKind};
use crate::engine::{Cf, Snapshot};

pub struct MvccReader<'a> {
    snap: &'a Snapshot,
}

impl<'a> MvccReader<'a> {
    pub fn new(snap: &'a Snapshot) -> Self {
        Self { snap }
    }

    pub fn load_lock(&self, key: &Key) -> Result<Option<Lock>, MvccError> {
        match self.snap.get_cf(Cf::Lock, &key.data_key()) {
            Some(bytes) => Lock::parse(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Versions of `key` with `commit_ts <= from_ts`, newest first.
    pub fn write_versions(
        &self,
        key: &Key,
        from_ts: Timestamp,
    ) -> impl Iterator<Item = Result<(Timestamp, Write), MvccError>> + '_ {
        let start = key.clone().append_ts(from_ts).data_key();
        let end = key.data_key_upper_bound();
        VersionIter {
            snap: self.snap,
            cursor: start,
            end,
        }
    }

    /// Newest version of `key` at or below `ts`.
    pub fn seek_write(
        &self,
        key: &Key,
        ts: Timestamp,
    ) -> Result<Option<(Timestamp, Write)>, MvccError> {
        self.write_versions(key, ts).next().transpose()
    }

    /// The write record created by the transaction that started at `start_ts`.
    pub fn get_txn_commit_record(
        &self,
        key: &Key,
        start_ts: Timestamp,
    ) -> Result<Option<(Timestamp, Write)>, MvccError> {
        for item in self.write_versions(key, MAX_TS) {
            let (commit_ts, write) = item?;
            if commit_ts < start_ts {
                break;
            }
            if write.start_ts == start_ts {
                return Ok(Some((commit_ts, write)));
            }
        }
        Ok(None)
    }

    /// Apply the Get rule: a lock at or below `read_ts` blocks the read,
    /// otherwise the newest `Put`/`Delete` at or below `read_ts` decides.
    pub fn get(&self, key: &Key, read_ts: Timestamp) -> Result<Option<Vec<u8>>, MvccError> {
        if let Some(lock) = self.load_lock(key)? {
            if lock.start_ts <= read_ts {
                return Err(MvccError::KeyIsLocked(lock.to_lock_info(key.to_raw()?)));
            }
        }
        for item in self.write_versions(key, read_ts) {
            let (_, write) = item?;
            match write.kind {
                WriteKind::Put => return self.load_value(key, &write).map(Some),
                WriteKind::Delete => return Ok(None),
                WriteKind::Lock => continue,
            }
        }
        Ok(None)
    }

    fn load_value(&self, key: &Key, write: &Write) -> Result<Vec<u8>, MvccError> {
        if let Some(v) = &write.short_value {
            return Ok(v.clone());
        }
        let dk = key.clone().append_ts(write.start_ts).data_key();
        self.snap
            .get_cf(Cf::Default, &dk)
            .ok_or_else(|| {
                MvccError::Corrupted(format!(
                    "default value missing for {:?} start_ts {}",
                    key, write.start_ts
                ))
            })
    }
}

struct VersionIter<'a> {
    snap: &'a Snapshot,
    cursor: Vec<u8>,
    end: Vec<u8>,
}

impl<'a> Iterator for VersionIter<'a> {
    type Item = Result<(Timestamp, Write), MvccError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (k, v) = self
            .snap
            .seek_cf(Cf::Write, &self.cursor, Some(&self.end))?;
        let item = decode_ts_from(&k).and_then(|ts| Write::parse(&v).map(|w| (ts, w)));
        let mut next = k;
        next.push(0);
        self.cursor = next;
        Some(item)
    }
}
