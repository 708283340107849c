//! Multi-version column family storage.
//!
//! Each column family is a lock-free skip list keyed by [`InternalKey`]:
//! user key ascending, then sequence number descending, so the newest
//! version of a key sorts first. A value of `None` is a tombstone.
//!
//! Every write batch gets the next sequence number and becomes visible when
//! [`Memtables::publish`] advances `visible_seq`. Readers pin a sequence
//! number; a shadowed version is pruned once no pinned number can see it.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct InternalKey {
    user_key: Vec<u8>,
    seq: Reverse<u64>,
}

impl InternalKey {
    pub(crate) fn new(user_key: &[u8], seq: u64) -> Self {
        Self {
            user_key: user_key.to_vec(),
            seq: Reverse(seq),
        }
    }

    /// Sorts after every version of `user_key`.
    fn after_all(user_key: &[u8]) -> Self {
        Self::new(user_key, 0)
    }

    pub(crate) fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq.0
    }
}

pub(crate) type VersionMap = SkipMap<InternalKey, Option<Vec<u8>>>;
type VersionEntry<'a> = Entry<'a, InternalKey, Option<Vec<u8>>>;

pub(crate) struct Memtables {
    cfs: Vec<VersionMap>,
    visible_seq: AtomicU64,
    /// Pinned sequence number -> number of snapshots holding it.
    pinned: Mutex<BTreeMap<u64, usize>>,
}

impl Memtables {
    pub(crate) fn new(cf_count: usize) -> Self {
        Self {
            cfs: (0..cf_count).map(|_| SkipMap::new()).collect(),
            visible_seq: AtomicU64::new(0),
            pinned: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn cf(&self, index: usize) -> &VersionMap {
        &self.cfs[index]
    }

    pub(crate) fn visible_seq(&self) -> u64 {
        self.visible_seq.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, seq: u64) {
        self.visible_seq.store(seq, Ordering::Release);
    }

    /// Pin the current visible sequence number.
    pub(crate) fn pin(&self) -> u64 {
        let mut pinned = self.pinned.lock();
        let seq = self.visible_seq();
        *pinned.entry(seq).or_insert(0) += 1;
        seq
    }

    pub(crate) fn pin_again(&self, seq: u64) {
        *self.pinned.lock().entry(seq).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&self, seq: u64) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&seq);
            }
        }
    }

    /// Pinned sequence numbers, ascending.
    pub(crate) fn pinned_seqs(&self) -> Vec<u64> {
        self.pinned.lock().keys().copied().collect()
    }

    pub(crate) fn pinned_count(&self) -> usize {
        self.pinned.lock().values().sum()
    }
}

/// The version of `key` visible at `seq`, tombstones included.
fn version_at<'a>(map: &'a VersionMap, key: &[u8], seq: u64) -> Option<VersionEntry<'a>> {
    map.lower_bound(Bound::Included(&InternalKey::new(key, seq)))
        .filter(|e| e.key().user_key() == key)
}

/// `None` when `key` has no version at `seq`, `Some(None)` for a tombstone.
pub(crate) fn get_at(map: &VersionMap, key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
    version_at(map, key, seq).map(|e| e.value().clone())
}

/// Remove the versions of `key` that no reader can see. The newest version
/// always stays; an older one stays only while some `pinned` sequence number
/// falls between its own and that of the next kept version.
pub(crate) fn prune_versions(map: &VersionMap, key: &[u8], pinned: &[u64]) -> usize {
    let Some(newest) = version_at(map, key, u64::MAX) else {
        return 0;
    };
    let mut newer_seq = newest.key().seq();
    let mut removed = 0;
    let mut cur = newest.next();
    while let Some(entry) = cur {
        if entry.key().user_key() != key {
            break;
        }
        cur = entry.next();
        let seq = entry.key().seq();
        if pinned.iter().any(|&p| p >= seq && p < newer_seq) {
            newer_seq = seq;
        } else if entry.remove() {
            removed += 1;
        }
    }
    removed
}

/// Remove `key` entirely when its only remaining version is a tombstone.
pub(crate) fn drop_tombstone(map: &VersionMap, key: &[u8]) -> bool {
    let Some(newest) = version_at(map, key, u64::MAX) else {
        return false;
    };
    if newest.value().is_some() {
        return false;
    }
    let older = newest
        .next()
        .map_or(false, |e| e.key().user_key() == key);
    !older && newest.remove()
}

/// Latest version at `seq` of every key in `[start, end)`, tombstones
/// included, in key order.
pub(crate) struct VersionIter<'a> {
    map: &'a VersionMap,
    seq: u64,
    end: Option<Vec<u8>>,
    next: Option<VersionEntry<'a>>,
}

impl<'a> VersionIter<'a> {
    pub(crate) fn new(map: &'a VersionMap, start: &[u8], end: Option<&[u8]>, seq: u64) -> Self {
        let next = match end {
            Some(e) if e <= start => None,
            _ => map.lower_bound(Bound::Included(&InternalKey::new(start, u64::MAX))),
        };
        Self {
            map,
            seq,
            end: end.map(|e| e.to_vec()),
            next,
        }
    }
}

impl<'a> Iterator for VersionIter<'a> {
    type Item = (Vec<u8>, Option<Vec<u8>>);

    fn next(&mut self) -> Option<Self::Item> {
        let mut entry = self.next.take()?;
        loop {
            if let Some(end) = &self.end {
                if entry.key().user_key() >= end.as_slice() {
                    return None;
                }
            }
            if entry.key().seq() > self.seq {
                entry = entry.next()?;
                continue;
            }
            let key = entry.key().user_key().to_vec();
            self.next = self
                .map
                .lower_bound(Bound::Excluded(&InternalKey::after_all(&key)));
            return Some((key, entry.value().clone()));
        }
    }
}
