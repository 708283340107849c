//! Column-family key-value engine backing the MVCC layer and the raft log.
//!
//! ```text
//!   Engine
//!   ├── Arc<Memtables>              versioned skip list per CF: default | lock | write | raft
//!   ├── Mutex<WriteState>
//!   │   ├── EngineWal (optional)    one record per WriteBatch, checkpointed by size
//!   │   └── PropsIndex per CF       running range properties
//!   └── tombstones: AtomicU64       drives write-stall and compaction checks
//! ```
//!
//! Writes are serialized by the state mutex. Each batch is stamped with the
//! next sequence number and published once fully applied, so a [`Snapshot`]
//! is just a pinned sequence number: taking one costs nothing, and writes
//! never copy existing data. Versions no pinned snapshot can see are pruned
//! as keys are rewritten.
//!
//! A delete leaves a tombstone. Tombstones stay until a manual compaction
//! drops them, which is what CheckAndCompact measures.

mod memtable;
mod props;
pub mod wal;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferrokv_common::config::StorageConfig;
use ferrokv_common::error::EngineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use self::memtable::{drop_tombstone, get_at, prune_versions, InternalKey, Memtables, VersionIter};
use self::props::{BucketStats, PropsIndex};
use self::wal::EngineWal;

pub type EngineResult<T> = Result<T, EngineError>;

/// Operations per record when the WAL is rewritten as a checkpoint.
const CHECKPOINT_BATCH_OPS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cf {
    Default,
    Lock,
    Write,
    Raft,
}

impl Cf {
    pub const ALL: [Cf; 4] = [Cf::Default, Cf::Lock, Cf::Write, Cf::Raft];
    /// Column families holding region data (everything but the raft log).
    pub const DATA: [Cf; 3] = [Cf::Default, Cf::Lock, Cf::Write];

    fn index(self) -> usize {
        match self {
            Cf::Default => 0,
            Cf::Lock => 1,
            Cf::Write => 2,
            Cf::Raft => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cf::Default => "default",
            Cf::Lock => "lock",
            Cf::Write => "write",
            Cf::Raft => "raft",
        }
    }

    pub fn from_name(name: &str) -> EngineResult<Cf> {
        Cf::ALL
            .into_iter()
            .find(|cf| cf.name() == name)
            .ok_or_else(|| EngineError::UnknownCf(name.to_string()))
    }
}

impl fmt::Display for Cf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { cf: Cf, key: Vec<u8>, value: Vec<u8> },
    Delete { cf: Cf, key: Vec<u8> },
    /// Deletes every live key in `[start, end)`.
    DeleteRange { cf: Cf, start: Vec<u8>, end: Vec<u8> },
}

/// A group of mutations applied atomically across column families.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    data_size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cf(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        self.data_size += key.len() + value.len();
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    pub fn delete_cf(&mut self, cf: Cf, key: Vec<u8>) {
        self.data_size += key.len();
        self.ops.push(BatchOp::Delete { cf, key });
    }

    pub fn delete_range_cf(&mut self, cf: Cf, start: Vec<u8>, end: Vec<u8>) {
        self.data_size += start.len() + end.len();
        self.ops.push(BatchOp::DeleteRange { cf, start, end });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.data_size = 0;
    }
}

/// Consistent point-in-time view of every column family.
///
/// Holds its sequence number pinned until dropped, which keeps the versions
/// it reads from being pruned.
pub struct Snapshot {
    tables: Arc<Memtables>,
    seq: u64,
}

impl Snapshot {
    fn new(tables: Arc<Memtables>) -> Self {
        let seq = tables.pin();
        Self { tables, seq }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn get_cf(&self, cf: Cf, key: &[u8]) -> Option<Vec<u8>> {
        get_at(self.tables.cf(cf.index()), key, self.seq).flatten()
    }

    /// Live entries of `cf` in `[start, end)`; `end = None` is unbounded.
    pub fn range_cf(
        &self,
        cf: Cf,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        VersionIter::new(self.tables.cf(cf.index()), start, end, self.seq)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
    }

    /// First live entry at or after `key`, bounded by `end`.
    pub fn seek_cf(&self, cf: Cf, key: &[u8], end: Option<&[u8]>) -> Option<(Vec<u8>, Vec<u8>)> {
        self.range_cf(cf, key, end).next()
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.tables.pin_again(self.seq);
        Self {
            tables: self.tables.clone(),
            seq: self.seq,
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.tables.unpin(self.seq);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq).finish()
    }
}

/// Cumulative totals of every entry before `key` in the sampled range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePoint {
    pub key: Vec<u8>,
    pub size: u64,
    pub keys: u64,
}

/// Size statistics of a key range, the in-memory analogue of SST table
/// properties. `samples` are ascending split candidates strictly inside
/// the range, roughly `properties_sample_step` live keys apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeProperties {
    pub num_entries: u64,
    pub num_deletes: u64,
    pub num_keys: u64,
    pub total_size: u64,
    pub samples: Vec<SamplePoint>,
}

impl RangeProperties {
    /// Tombstone share of all entries, 0-100.
    pub fn delete_percent(&self) -> u64 {
        if self.num_entries == 0 {
            0
        } else {
            self.num_deletes * 100 / self.num_entries
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub write_stall_tombstones: u64,
    pub properties_sample_step: usize,
    pub sync_wal: bool,
    /// `0` disables size-triggered WAL checkpoints.
    pub wal_checkpoint_bytes: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for EngineOptions {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            write_stall_tombstones: cfg.write_stall_tombstones,
            properties_sample_step: cfg.properties_sample_step.max(1),
            sync_wal: cfg.sync_wal,
            wal_checkpoint_bytes: cfg.wal_checkpoint_bytes,
        }
    }
}

struct WriteState {
    wal: Option<EngineWal>,
    props: Vec<PropsIndex>,
    /// WAL size right after the last checkpoint.
    checkpoint_base: u64,
}

pub struct Engine {
    tables: Arc<Memtables>,
    state: Mutex<WriteState>,
    tombstones: AtomicU64,
    opts: EngineOptions,
}

impl Engine {
    /// Engine without a WAL. Contents are lost on drop.
    pub fn new_in_memory(opts: EngineOptions) -> Self {
        Self {
            tables: Arc::new(Memtables::new(Cf::ALL.len())),
            state: Mutex::new(WriteState {
                wal: None,
                props: Cf::ALL.iter().map(|_| PropsIndex::new()).collect(),
                checkpoint_base: 0,
            }),
            tombstones: AtomicU64::new(0),
            opts,
        }
    }

    /// Open (or create) a durable engine in `dir`, replaying its WAL. A torn
    /// tail left by a crash is cut off before the log accepts new records.
    pub fn open(dir: &Path, opts: EngineOptions) -> EngineResult<Self> {
        let replay = EngineWal::read_all(dir)?;
        let engine = Self::new_in_memory(opts);
        {
            let mut state = engine.state.lock();
            for batch in &replay.batches {
                engine.apply_locked(&mut state, batch);
            }
            let wal = EngineWal::open_at(dir, engine.opts.sync_wal, replay.valid_len)?;
            state.checkpoint_base = wal.size();
            state.wal = Some(wal);
        }
        tracing::info!(
            dir = %dir.display(),
            batches = replay.batches.len(),
            wal_bytes = replay.valid_len,
            "engine opened, WAL replayed"
        );
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.tables.clone())
    }

    /// Newest value of `key`, read without pinning a snapshot.
    pub fn get_cf(&self, cf: Cf, key: &[u8]) -> Option<Vec<u8>> {
        get_at(self.tables.cf(cf.index()), key, u64::MAX).flatten()
    }

    pub fn put_cf(&self, cf: Cf, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let mut wb = WriteBatch::new();
        wb.put_cf(cf, key.to_vec(), value.to_vec());
        self.write(&wb)
    }

    /// Apply `batch` atomically. Logged to the WAL first when durable.
    pub fn write(&self, batch: &WriteBatch) -> EngineResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if let Some(wal) = state.wal.as_mut() {
            wal.append(batch)?;
        }
        self.apply_locked(&mut state, batch);

        let threshold = self.opts.wal_checkpoint_bytes;
        let due = match &state.wal {
            Some(wal) if threshold > 0 => {
                wal.size() >= threshold.max(state.checkpoint_base.saturating_mul(2))
            }
            _ => false,
        };
        if due {
            // The batch is already durable in the current log.
            if let Err(e) = self.checkpoint_locked(&mut state) {
                tracing::error!(error = %e, "WAL checkpoint failed");
            }
        }
        Ok(())
    }

    /// Stamp `batch` with the next sequence number, apply it, publish it and
    /// prune the versions it shadowed.
    fn apply_locked(&self, state: &mut WriteState, batch: &WriteBatch) {
        let seq = self.tables.visible_seq() + 1;
        let step = self.opts.properties_sample_step as u64;
        let mut touched: Vec<(Cf, Vec<u8>)> = Vec::with_capacity(batch.count());
        let mut delta = 0i64;

        for op in batch.ops() {
            match op {
                BatchOp::Put { cf, key, value } => {
                    delta += self.set_version(state, *cf, key, Some(value), seq, step);
                    touched.push((*cf, key.clone()));
                }
                BatchOp::Delete { cf, key } => {
                    delta += self.set_version(state, *cf, key, None, seq, step);
                    touched.push((*cf, key.clone()));
                }
                BatchOp::DeleteRange { cf, start, end } => {
                    let live: Vec<Vec<u8>> =
                        VersionIter::new(self.tables.cf(cf.index()), start, Some(end), seq)
                            .filter(|(_, v)| v.is_some())
                            .map(|(k, _)| k)
                            .collect();
                    for key in live {
                        delta += self.set_version(state, *cf, &key, None, seq, step);
                        touched.push((*cf, key));
                    }
                }
            }
        }
        self.tables.publish(seq);
        self.adjust_tombstones(delta);

        let pinned = self.tables.pinned_seqs();
        for (cf, key) in &touched {
            prune_versions(self.tables.cf(cf.index()), key, &pinned);
        }
    }

    /// Insert one version and update the range properties. Returns the
    /// change in tombstone count.
    fn set_version(
        &self,
        state: &mut WriteState,
        cf: Cf,
        key: &[u8],
        value: Option<&Vec<u8>>,
        seq: u64,
        step: u64,
    ) -> i64 {
        let map = self.tables.cf(cf.index());
        let prev = get_at(map, key, seq);
        let before = BucketStats::of(key, prev.as_ref().map(|v| v.as_deref()));
        let after = BucketStats::of(key, Some(value.map(|v| v.as_slice())));
        map.insert(InternalKey::new(key, seq), value.cloned());
        state.props[cf.index()].update(key, before, after, map, seq, step);
        after.deletes as i64 - before.deletes as i64
    }

    /// Drop tombstones of `cf` in `[start, end)`. Returns how many were
    /// removed. A tombstone stays while a live snapshot still reads a
    /// version beneath it.
    pub fn compact_range_cf(&self, cf: Cf, start: Option<&[u8]>, end: Option<&[u8]>) -> u64 {
        let start = start.unwrap_or(&[]);
        let mut state = self.state.lock();
        let map = self.tables.cf(cf.index());
        let seq = self.tables.visible_seq();
        let pinned = self.tables.pinned_seqs();
        let step = self.opts.properties_sample_step as u64;

        let keys: Vec<(Vec<u8>, bool)> = VersionIter::new(map, start, end, seq)
            .map(|(k, v)| (k, v.is_none()))
            .collect();
        let mut removed = 0u64;
        for (key, is_tombstone) in keys {
            prune_versions(map, &key, &pinned);
            if is_tombstone && drop_tombstone(map, &key) {
                let before = BucketStats::of(&key, Some(None));
                state.props[cf.index()].update(&key, before, BucketStats::default(), map, seq, step);
                removed += 1;
            }
        }
        self.adjust_tombstones(-(removed as i64));

        if removed > 0 && self.opts.wal_checkpoint_bytes > 0 {
            let due = state.wal.as_ref().map_or(false, |wal| {
                wal.size() > state.checkpoint_base && wal.size() >= self.opts.wal_checkpoint_bytes
            });
            if due {
                if let Err(e) = self.checkpoint_locked(&mut state) {
                    tracing::error!(error = %e, "WAL checkpoint after compaction failed");
                }
            }
        }
        removed
    }

    /// Rewrite the WAL as the live contents of every column family.
    pub fn checkpoint_wal(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.checkpoint_locked(&mut state)
    }

    fn checkpoint_locked(&self, state: &mut WriteState) -> EngineResult<()> {
        let Some(wal) = state.wal.as_mut() else {
            return Ok(());
        };
        let before = wal.size();
        let seq = self.tables.visible_seq();
        let tables = &self.tables;
        let mut entries = Cf::ALL.into_iter().flat_map(move |cf| {
            VersionIter::new(tables.cf(cf.index()), &[], None, seq).map(move |(k, v)| (cf, k, v))
        });
        let batches = std::iter::from_fn(move || {
            let mut wb = WriteBatch::new();
            for (cf, key, value) in entries.by_ref() {
                match value {
                    Some(value) => wb.put_cf(cf, key, value),
                    None => wb.delete_cf(cf, key),
                }
                if wb.count() >= CHECKPOINT_BATCH_OPS {
                    break;
                }
            }
            (!wb.is_empty()).then_some(wb)
        });
        let after = wal.rewrite(batches)?;
        state.checkpoint_base = after;
        tracing::info!(before, after, seq, "WAL checkpointed");
        Ok(())
    }

    pub fn range_properties(&self, cf: Cf, start: &[u8], end: Option<&[u8]>) -> RangeProperties {
        let state = self.state.lock();
        state.props[cf.index()].range(
            self.tables.cf(cf.index()),
            self.tables.visible_seq(),
            start,
            end,
            self.opts.properties_sample_step as u64,
        )
    }

    pub fn tombstone_count(&self) -> u64 {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// True while outstanding tombstones exceed the stall threshold.
    pub fn is_write_stalled(&self) -> bool {
        self.opts.write_stall_tombstones > 0
            && self.tombstone_count() >= self.opts.write_stall_tombstones
    }

    /// Live bytes across every column family.
    pub fn used_size(&self) -> u64 {
        let state = self.state.lock();
        state.props.iter().map(|p| p.total().size).sum()
    }

    /// Stored versions of `cf`, shadowed ones and tombstones included.
    pub fn version_count(&self, cf: Cf) -> usize {
        self.tables.cf(cf.index()).len()
    }

    /// Snapshots currently alive.
    pub fn live_snapshots(&self) -> usize {
        self.tables.pinned_count()
    }

    pub fn wal_size(&self) -> Option<u64> {
        self.state.lock().wal.as_ref().map(|w| w.size())
    }

    pub fn is_durable(&self) -> bool {
        self.state.lock().wal.is_some()
    }

    fn adjust_tombstones(&self, delta: i64) {
        if delta >= 0 {
            self.tombstones.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let dec = delta.unsigned_abs();
            let _ = self
                .tombstones
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                    Some(cur.saturating_sub(dec))
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> EngineOptions {
        EngineOptions {
            write_stall_tombstones: 3,
            properties_sample_step: 2,
            sync_wal: false,
            wal_checkpoint_bytes: 0,
        }
    }

    fn engine() -> Engine {
        Engine::new_in_memory(opts())
    }

    #[test]
    fn test_put_get_delete() {
        let e = engine();
        e.put_cf(Cf::Default, b"a", b"1").unwrap();
        assert_eq!(e.get_cf(Cf::Default, b"a"), Some(b"1".to_vec()));
        assert_eq!(e.get_cf(Cf::Lock, b"a"), None);

        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Default, b"a".to_vec());
        e.write(&wb).unwrap();
        assert_eq!(e.get_cf(Cf::Default, b"a"), None);
        assert_eq!(e.tombstone_count(), 1);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let e = engine();
        e.put_cf(Cf::Write, b"k", b"old").unwrap();
        let snap = e.snapshot();
        e.put_cf(Cf::Write, b"k", b"new").unwrap();
        e.put_cf(Cf::Write, b"k2", b"x").unwrap();
        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Write, b"k".to_vec());
        e.write(&wb).unwrap();

        assert_eq!(snap.get_cf(Cf::Write, b"k"), Some(b"old".to_vec()));
        assert_eq!(snap.range_cf(Cf::Write, b"", None).count(), 1);
        assert_eq!(e.snapshot().range_cf(Cf::Write, b"", None).count(), 1);
        assert_eq!(e.get_cf(Cf::Write, b"k2"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_batch_becomes_visible_at_once() {
        let e = engine();
        let before = e.snapshot();
        let mut wb = WriteBatch::new();
        wb.put_cf(Cf::Lock, b"a".to_vec(), b"1".to_vec());
        wb.put_cf(Cf::Write, b"b".to_vec(), b"2".to_vec());
        wb.put_cf(Cf::Lock, b"a".to_vec(), b"3".to_vec());
        e.write(&wb).unwrap();
        let after = e.snapshot();
        assert_eq!(after.sequence(), before.sequence() + 1);
        assert_eq!(before.get_cf(Cf::Lock, b"a"), None);
        assert_eq!(after.get_cf(Cf::Lock, b"a"), Some(b"3".to_vec()));
        assert_eq!(after.get_cf(Cf::Write, b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_shadowed_versions_pruned_once_snapshots_drop() {
        let e = engine();
        e.put_cf(Cf::Default, b"k", b"0").unwrap();
        let snap = e.snapshot();
        let copy = snap.clone();
        for i in 1..=5u8 {
            e.put_cf(Cf::Default, b"k", &[i]).unwrap();
        }
        // The pinned version plus the newest one.
        assert_eq!(e.version_count(Cf::Default), 2);
        assert_eq!(e.live_snapshots(), 2);
        drop(snap);
        assert_eq!(copy.get_cf(Cf::Default, b"k"), Some(b"0".to_vec()));
        drop(copy);
        assert_eq!(e.live_snapshots(), 0);

        e.put_cf(Cf::Default, b"k", b"last").unwrap();
        assert_eq!(e.version_count(Cf::Default), 1);
        assert_eq!(e.get_cf(Cf::Default, b"k"), Some(b"last".to_vec()));
    }

    #[test]
    fn test_range_skips_tombstones_and_respects_bounds() {
        let e = engine();
        for k in [b"a", b"b", b"c", b"d"] {
            e.put_cf(Cf::Default, k, b"v").unwrap();
        }
        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Default, b"b".to_vec());
        e.write(&wb).unwrap();

        let snap = e.snapshot();
        let keys: Vec<Vec<u8>> = snap
            .range_cf(Cf::Default, b"a", Some(b"d"))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
        // Inverted bounds yield nothing rather than panicking.
        assert_eq!(snap.range_cf(Cf::Default, b"c", Some(b"a")).count(), 0);
        assert_eq!(
            snap.seek_cf(Cf::Default, b"b", None).map(|(k, _)| k),
            Some(b"c".to_vec())
        );
    }

    #[test]
    fn test_delete_range_then_compact() {
        let e = engine();
        for k in [b"a", b"b", b"c", b"d"] {
            e.put_cf(Cf::Write, k, b"v").unwrap();
        }
        let mut wb = WriteBatch::new();
        wb.delete_range_cf(Cf::Write, b"a".to_vec(), b"d".to_vec());
        e.write(&wb).unwrap();
        assert_eq!(e.tombstone_count(), 3);
        assert!(e.is_write_stalled());

        let props = e.range_properties(Cf::Write, b"", None);
        assert_eq!(props.num_entries, 4);
        assert_eq!(props.num_deletes, 3);
        assert_eq!(props.delete_percent(), 75);

        assert_eq!(e.compact_range_cf(Cf::Write, None, None), 3);
        assert_eq!(e.tombstone_count(), 0);
        assert!(!e.is_write_stalled());
        assert_eq!(e.range_properties(Cf::Write, b"", None).num_entries, 1);
        assert_eq!(e.version_count(Cf::Write), 1);
    }

    #[test]
    fn test_compaction_keeps_tombstones_a_snapshot_needs() {
        let e = engine();
        e.put_cf(Cf::Write, b"a", b"v").unwrap();
        let snap = e.snapshot();
        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Write, b"a".to_vec());
        e.write(&wb).unwrap();

        assert_eq!(e.compact_range_cf(Cf::Write, None, None), 0);
        assert_eq!(snap.get_cf(Cf::Write, b"a"), Some(b"v".to_vec()));
        drop(snap);
        assert_eq!(e.compact_range_cf(Cf::Write, None, None), 1);
        assert_eq!(e.version_count(Cf::Write), 0);
    }

    #[test]
    fn test_put_over_tombstone_reduces_count() {
        let e = engine();
        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Lock, b"k".to_vec());
        e.write(&wb).unwrap();
        assert_eq!(e.tombstone_count(), 1);
        e.put_cf(Cf::Lock, b"k", b"v").unwrap();
        assert_eq!(e.tombstone_count(), 0);
    }

    #[test]
    fn test_range_properties_samples() {
        let e = engine();
        for i in 0..5u8 {
            e.put_cf(Cf::Write, &[b'k', i], &[0u8; 8]).unwrap();
        }
        let props = e.range_properties(Cf::Write, b"", None);
        assert_eq!(props.num_keys, 5);
        assert_eq!(props.total_size, 50);
        // Five entries overflow one bucket of a step-2 index.
        assert_eq!(
            props.samples,
            vec![SamplePoint {
                key: vec![b'k', 2],
                size: 20,
                keys: 2,
            }]
        );

        let props = e.range_properties(Cf::Write, &[b'k', 1], Some(&[b'k', 4]));
        assert_eq!(props.num_keys, 3);
        assert_eq!(props.total_size, 30);
        assert!(props.samples.iter().all(|s| s.key > vec![b'k', 1]));
    }

    #[test]
    fn test_properties_track_overwrites_and_deletes() {
        let e = engine();
        e.put_cf(Cf::Default, b"a", b"12345").unwrap();
        e.put_cf(Cf::Default, b"a", b"1").unwrap();
        e.put_cf(Cf::Default, b"b", b"22").unwrap();
        let mut wb = WriteBatch::new();
        wb.delete_cf(Cf::Default, b"b".to_vec());
        e.write(&wb).unwrap();
        let props = e.range_properties(Cf::Default, b"", None);
        assert_eq!(props.num_entries, 2);
        assert_eq!(props.num_deletes, 1);
        assert_eq!(props.num_keys, 1);
        assert_eq!(props.total_size, 2);
    }

    #[test]
    fn test_cf_names_round_trip() {
        for cf in Cf::ALL {
            assert_eq!(Cf::from_name(cf.name()).unwrap(), cf);
        }
        assert!(Cf::from_name("nope").is_err());
    }

    #[test]
    fn test_used_size_counts_live_entries() {
        let e = engine();
        e.put_cf(Cf::Default, b"ab", b"cde").unwrap();
        e.put_cf(Cf::Raft, b"x", b"y").unwrap();
        assert_eq!(e.used_size(), 7);
    }

    #[test]
    fn test_wal_checkpoints_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let e = Engine::open(
            dir.path(),
            EngineOptions {
                wal_checkpoint_bytes: 4096,
                ..opts()
            },
        )
        .unwrap();
        for i in 0..2000u32 {
            e.put_cf(Cf::Raft, b"hot", &i.to_be_bytes()).unwrap();
        }
        assert!(e.wal_size().unwrap() < 8192);
        drop(e);

        let e = Engine::open(dir.path(), opts()).unwrap();
        assert_eq!(e.get_cf(Cf::Raft, b"hot"), Some(1999u32.to_be_bytes().to_vec()));
    }
}
