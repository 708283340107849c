//! Incrementally maintained range properties.
//!
//! Each column family keeps a [`PropsIndex`]: ordered buckets, each covering
//! `[start, next start)`, holding running counts over the newest version of
//! every key inside it. Writes adjust one bucket; a bucket that grows past
//! twice the sample step is split at its median key. A range query adds up
//! the buckets it fully covers and walks only the two at its edges.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::memtable::{VersionIter, VersionMap};
use super::{RangeProperties, SamplePoint};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BucketStats {
    pub entries: u64,
    pub deletes: u64,
    pub keys: u64,
    pub size: u64,
}

impl BucketStats {
    /// Contribution of one key. `state` is `None` for an absent key and
    /// `Some(None)` for a tombstone.
    pub(crate) fn of(key: &[u8], state: Option<Option<&[u8]>>) -> Self {
        match state {
            None => Self::default(),
            Some(None) => Self {
                entries: 1,
                deletes: 1,
                ..Self::default()
            },
            Some(Some(value)) => Self {
                entries: 1,
                keys: 1,
                size: (key.len() + value.len()) as u64,
                ..Self::default()
            },
        }
    }

    fn add(&mut self, other: &Self) {
        self.entries += other.entries;
        self.deletes += other.deletes;
        self.keys += other.keys;
        self.size += other.size;
    }

    fn sub(&mut self, other: &Self) {
        self.entries = self.entries.saturating_sub(other.entries);
        self.deletes = self.deletes.saturating_sub(other.deletes);
        self.keys = self.keys.saturating_sub(other.keys);
        self.size = self.size.saturating_sub(other.size);
    }
}

pub(crate) struct PropsIndex {
    buckets: BTreeMap<Vec<u8>, BucketStats>,
    total: BucketStats,
}

impl PropsIndex {
    pub(crate) fn new() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(Vec::new(), BucketStats::default());
        Self {
            buckets,
            total: BucketStats::default(),
        }
    }

    pub(crate) fn total(&self) -> BucketStats {
        self.total
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_start(&self, key: &[u8]) -> Vec<u8> {
        self.buckets
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_default()
    }

    fn bucket_end(&self, start: &[u8]) -> Option<Vec<u8>> {
        self.buckets
            .range::<[u8], _>((Bound::Excluded(start), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    /// Move `key` from `before` to `after`, splitting its bucket against
    /// `map` at `seq` once it holds more than `2 * step` entries.
    pub(crate) fn update(
        &mut self,
        key: &[u8],
        before: BucketStats,
        after: BucketStats,
        map: &VersionMap,
        seq: u64,
        step: u64,
    ) {
        if before == after {
            return;
        }
        self.total.sub(&before);
        self.total.add(&after);
        let start = self.bucket_start(key);
        let Some(bucket) = self.buckets.get_mut(&start) else {
            return;
        };
        bucket.sub(&before);
        bucket.add(&after);
        let entries = bucket.entries;
        if entries == 0 && !start.is_empty() {
            self.buckets.remove(&start);
        } else if entries > 2 * step.max(1) {
            self.split(&start, map, seq);
        }
    }

    fn split(&mut self, start: &[u8], map: &VersionMap, seq: u64) {
        let end = self.bucket_end(start);
        let entries: Vec<(Vec<u8>, BucketStats)> = VersionIter::new(map, start, end.as_deref(), seq)
            .map(|(k, v)| {
                let stats = BucketStats::of(&k, Some(v.as_deref()));
                (k, stats)
            })
            .collect();
        if entries.len() < 2 {
            return;
        }
        let mid = entries.len() / 2;
        let mut left = BucketStats::default();
        let mut right = BucketStats::default();
        for (i, (_, stats)) in entries.iter().enumerate() {
            if i < mid {
                left.add(stats);
            } else {
                right.add(stats);
            }
        }
        self.buckets.insert(start.to_vec(), left);
        self.buckets.insert(entries[mid].0.clone(), right);
    }

    /// Properties of `[start, end)` as of `seq`. `samples` gets one point at
    /// each fully covered bucket boundary and one every `step` live keys
    /// inside the walked edge buckets.
    pub(crate) fn range(
        &self,
        map: &VersionMap,
        seq: u64,
        start: &[u8],
        end: Option<&[u8]>,
        step: u64,
    ) -> RangeProperties {
        let mut props = RangeProperties::default();
        if matches!(end, Some(e) if e <= start) {
            return props;
        }
        let step = step.max(1);
        let first = self.bucket_start(start);
        let mut buckets = self
            .buckets
            .range::<[u8], _>((Bound::Included(first.as_slice()), Bound::Unbounded))
            .peekable();

        while let Some((bucket_start, stats)) = buckets.next() {
            if matches!(end, Some(e) if bucket_start.as_slice() >= e) {
                break;
            }
            let bucket_end = buckets.peek().map(|(k, _)| k.as_slice());
            let covers_start = bucket_start.as_slice() >= start;
            let covers_end = match (bucket_end, end) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(b), Some(e)) => b <= e,
            };

            if covers_start && covers_end {
                props.num_entries += stats.entries;
                props.num_deletes += stats.deletes;
                props.num_keys += stats.keys;
                props.total_size += stats.size;
                if let Some(b) = bucket_end {
                    if end.map_or(true, |e| b < e) && stats.keys > 0 {
                        props.samples.push(SamplePoint {
                            key: b.to_vec(),
                            size: props.total_size,
                            keys: props.num_keys,
                        });
                    }
                }
                continue;
            }

            let lo = if covers_start { bucket_start.as_slice() } else { start };
            let hi = match (bucket_end, end) {
                (Some(b), Some(e)) => Some(b.min(e)),
                (b, e) => b.or(e),
            };
            let mut walked = 0u64;
            for (k, v) in VersionIter::new(map, lo, hi, seq) {
                props.num_entries += 1;
                match v {
                    None => props.num_deletes += 1,
                    Some(v) => {
                        if walked > 0 && walked % step == 0 {
                            props.samples.push(SamplePoint {
                                key: k.clone(),
                                size: props.total_size,
                                keys: props.num_keys,
                            });
                        }
                        walked += 1;
                        props.num_keys += 1;
                        props.total_size += (k.len() + v.len()) as u64;
                    }
                }
            }
        }
        props
    }
}
