//! Lazy forward scan over a point-in-time snapshot.
//!
//! The scanner walks the union of keys present in the lock and write column
//! families in ascending order and applies the Get rule to each. Keys with no
//! visible value are skipped; a blocking lock yields an error [`Pair`].
//! The scanner is finite and not restartable: continue from a new start key.

use ferrokv_common::keys;
use ferrokv_common::Timestamp;

use super::codec::{Key, TS_LEN};
use super::reader::MvccReader;
use super::Pair;
use crate::engine::{Cf, Snapshot};

pub struct MvccScanner {
    snap: Snapshot,
    cursor: Vec<u8>,
    upper: Vec<u8>,
    read_ts: Timestamp,
    exhausted: bool,
}

impl MvccScanner {
    /// Scan `[start, end)` in raw key space; an empty `end` is unbounded.
    pub fn new(snap: Snapshot, start: &[u8], end: &[u8], read_ts: Timestamp) -> Self {
        let upper = if end.is_empty() {
            keys::DATA_MAX_KEY.to_vec()
        } else {
            Key::from_raw(end).data_key()
        };
        Self {
            snap,
            cursor: Key::from_raw(start).data_key(),
            upper,
            read_ts,
            exhausted: false,
        }
    }

    fn next_user_key(&self) -> Option<Key> {
        let from_lock = self
            .snap
            .seek_cf(Cf::Lock, &self.cursor, Some(&self.upper))
            .and_then(|(k, _)| keys::origin_key(&k).map(Key::from_encoded_slice));
        let from_write = self
            .snap
            .seek_cf(Cf::Write, &self.cursor, Some(&self.upper))
            .and_then(|(k, _)| {
                keys::origin_key(&k)
                    .filter(|enc| enc.len() >= TS_LEN)
                    .map(|enc| Key::from_encoded_slice(&enc[..enc.len() - TS_LEN]))
            });
        match (from_lock, from_write) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Iterator for MvccScanner {
    type Item = Pair;

    fn next(&mut self) -> Option<Pair> {
        while !self.exhausted {
            let key = match self.next_user_key() {
                Some(k) => k,
                None => {
                    self.exhausted = true;
                    break;
                }
            };
            self.cursor = key.data_key_upper_bound();

            let raw = match key.to_raw() {
                Ok(raw) => raw,
                Err(e) => {
                    return Some(Pair {
                        key: key.into_encoded(),
                        result: Err(e),
                    })
                }
            };
            match MvccReader::new(&self.snap).get(&key, self.read_ts) {
                Ok(Some(value)) => return Some(Pair { key: raw, result: Ok(value) }),
                Ok(None) => continue,
                Err(e) => return Some(Pair { key: raw, result: Err(e) }),
            }
        }
        None
    }
}
