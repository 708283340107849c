use std::sync::Arc;

use ferrokv_common::error::MvccError;
use ferrokv_common::{keys, LockInfo, Timestamp};
use ferrokv_observability as obs;
use tracing::Span;

use super::codec::Key;
use super::latch::Latches;
use super::lock::{Lock, LockKind};
use super::reader::MvccReader;
use super::scanner::MvccScanner;
use super::write::{Write, WriteKind};
use super::{Mutation, Op, Pair, SHORT_VALUE_MAX_LEN};
use crate::engine::{Cf, Engine, WriteBatch};

/// Percolator-style transactional store over the lock/write/default
/// column families of an [`Engine`].
///
/// Reads never take latches; they rely on lock visibility. Every mutation
/// (prewrite, commit, rollback) holds the latches of all its keys for the
/// whole read-check-write sequence and applies its effects in one batch.
pub struct MvccStore {
    engine: Arc<Engine>,
    latches: Latches,
    span: Span,
}

fn error_kind_label(e: &MvccError) -> &'static str {
    match e.kind() {
        ferrokv_common::ErrorKind::Locked => "locked",
        ferrokv_common::ErrorKind::Retryable => "retryable",
        ferrokv_common::ErrorKind::Abort => "abort",
        _ => "internal",
    }
}

impl MvccStore {
    pub fn new(engine: Arc<Engine>, latch_slots: usize) -> Self {
        Self {
            engine,
            latches: Latches::new(latch_slots),
            span: Span::none(),
        }
    }

    /// Attach the span every operation of this store is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn get(&self, key: &[u8], read_ts: Timestamp) -> Result<Option<Vec<u8>>, MvccError> {
        obs::record_mvcc_command("get");
        let snap = self.engine.snapshot();
        let res = MvccReader::new(&snap).get(&Key::from_raw(key), read_ts);
        if let Err(e) = &res {
            obs::record_mvcc_error("get", error_kind_label(e));
        }
        res
    }

    /// Lazy scan of `[start, end)` at `read_ts`; an empty `end` is unbounded.
    pub fn scanner(&self, start: &[u8], end: &[u8], read_ts: Timestamp) -> MvccScanner {
        MvccScanner::new(self.engine.snapshot(), start, end, read_ts)
    }

    /// At most `limit` pairs from `[start, end)`; `limit = 0` means no limit.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize, read_ts: Timestamp) -> Vec<Pair> {
        obs::record_mvcc_command("scan");
        let scanner = self.scanner(start, end, read_ts);
        if limit == 0 {
            scanner.collect()
        } else {
            scanner.take(limit).collect()
        }
    }

    /// Evaluate the Get rule independently per key. Keys without a visible
    /// value are omitted; errors stay in place.
    pub fn batch_get(&self, keys: &[Vec<u8>], read_ts: Timestamp) -> Vec<Pair> {
        obs::record_mvcc_command("batch_get");
        let snap = self.engine.snapshot();
        let reader = MvccReader::new(&snap);
        keys.iter()
            .filter_map(|k| match reader.get(&Key::from_raw(k), read_ts) {
                Ok(Some(v)) => Some(Pair {
                    key: k.clone(),
                    result: Ok(v),
                }),
                Ok(None) => None,
                Err(e) => Some(Pair {
                    key: k.clone(),
                    result: Err(e),
                }),
            })
            .collect()
    }

    /// Phase one of two-phase commit. Returns one result per mutation.
    ///
    /// A failing slot does not stop the others; locks of every succeeding
    /// slot are installed in one batch while all latches are still held.
    pub fn prewrite(
        &self,
        mutations: &[Mutation],
        primary: &[u8],
        start_ts: Timestamp,
        ttl: u64,
    ) -> Vec<Result<(), MvccError>> {
        let _enter = self.span.enter();
        obs::record_mvcc_command("prewrite");
        let _guard = self.latches.acquire(mutations.iter().map(|m| m.key.as_slice()));
        let mut wb = WriteBatch::new();
        let mut results: Vec<Result<(), MvccError>> = {
            let snap = self.engine.snapshot();
            let reader = MvccReader::new(&snap);
            mutations
                .iter()
                .map(|m| prewrite_mutation(&reader, &mut wb, m, primary, start_ts, ttl))
                .collect()
        };

        if let Err(e) = self.engine.write(&wb) {
            tracing::error!(start_ts, error = %e, "prewrite batch failed");
            for r in results.iter_mut().filter(|r| r.is_ok()) {
                *r = Err(MvccError::Engine(e.to_string()));
            }
        }
        for e in results.iter().filter_map(|r| r.as_ref().err()) {
            obs::record_mvcc_error("prewrite", error_kind_label(e));
            tracing::debug!(start_ts, error = %e, "prewrite slot failed");
        }
        results
    }

    /// Phase two: turn this transaction's locks into write records at
    /// `commit_ts`. All-or-nothing across `keys`.
    pub fn commit(
        &self,
        keys: &[Vec<u8>],
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> Result<(), MvccError> {
        let _enter = self.span.enter();
        obs::record_mvcc_command("commit");
        if commit_ts <= start_ts {
            obs::record_mvcc_error("commit", "abort");
            return Err(MvccError::InvalidCommitTs {
                start_ts,
                commit_ts,
            });
        }
        let _guard = self.latches.acquire(keys.iter().map(|k| k.as_slice()));
        let wb = {
            let snap = self.engine.snapshot();
            let reader = MvccReader::new(&snap);
            let mut wb = WriteBatch::new();
            for raw in keys {
                let key = Key::from_raw(raw);
                match reader.load_lock(&key)? {
                    Some(lock) if lock.start_ts == start_ts => {
                        let write = Write::new(
                            WriteKind::from_lock_kind(lock.kind),
                            start_ts,
                            lock.short_value,
                        );
                        wb.put_cf(
                            Cf::Write,
                            key.clone().append_ts(commit_ts).data_key(),
                            write.to_bytes(),
                        );
                        wb.delete_cf(Cf::Lock, key.data_key());
                    }
                    _ => {
                        if reader.get_txn_commit_record(&key, start_ts)?.is_some() {
                            tracing::debug!(start_ts, "key already committed, skipping");
                            continue;
                        }
                        obs::record_mvcc_error("commit", "abort");
                        tracing::warn!(start_ts, commit_ts, "commit found no lock and no record");
                        return Err(MvccError::TxnLockNotFound {
                            key: raw.clone(),
                            start_ts,
                            commit_ts,
                        });
                    }
                }
            }
            wb
        };
        self.engine.write(&wb)?;
        Ok(())
    }

    /// Remove this transaction's locks. Keys without a matching lock are
    /// left alone.
    pub fn rollback(&self, keys: &[Vec<u8>], start_ts: Timestamp) -> Result<(), MvccError> {
        let _enter = self.span.enter();
        obs::record_mvcc_command("rollback");
        let _guard = self.latches.acquire(keys.iter().map(|k| k.as_slice()));
        let wb = {
            let snap = self.engine.snapshot();
            let reader = MvccReader::new(&snap);
            let mut wb = WriteBatch::new();
            for raw in keys {
                let key = Key::from_raw(raw);
                match reader.load_lock(&key)? {
                    Some(lock) if lock.start_ts == start_ts => {
                        if lock.kind == LockKind::Put && lock.short_value.is_none() {
                            wb.delete_cf(Cf::Default, key.clone().append_ts(start_ts).data_key());
                        }
                        wb.delete_cf(Cf::Lock, key.data_key());
                    }
                    _ => tracing::debug!(start_ts, "no matching lock, rollback is a no-op"),
                }
            }
            wb
        };
        self.engine.write(&wb)?;
        Ok(())
    }

    /// Locks in `[start, end)` with `start_ts <= max_ts`, at most `limit`
    /// (`0` = no limit).
    pub fn scan_locks(
        &self,
        start: &[u8],
        end: &[u8],
        max_ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<LockInfo>, MvccError> {
        obs::record_mvcc_command("scan_lock");
        let snap = self.engine.snapshot();
        let lower = Key::from_raw(start).data_key();
        let upper = if end.is_empty() {
            keys::DATA_MAX_KEY.to_vec()
        } else {
            Key::from_raw(end).data_key()
        };
        let mut locks = Vec::new();
        for (k, v) in snap.range_cf(Cf::Lock, &lower, Some(&upper)) {
            let lock = Lock::parse(&v)?;
            if lock.start_ts > max_ts {
                continue;
            }
            let raw = super::codec::raw_key_from_data_key(&k)?;
            locks.push(lock.to_lock_info(raw));
            if limit > 0 && locks.len() >= limit {
                break;
            }
        }
        Ok(locks)
    }
}

fn prewrite_mutation(
    reader: &MvccReader<'_>,
    wb: &mut WriteBatch,
    m: &Mutation,
    primary: &[u8],
    start_ts: Timestamp,
    ttl: u64,
) -> Result<(), MvccError> {
    let key = Key::from_raw(&m.key);
    if let Some(lock) = reader.load_lock(&key)? {
        if lock.start_ts != start_ts {
            return Err(MvccError::KeyIsLocked(lock.to_lock_info(m.key.clone())));
        }
        // Same transaction prewrote this key already.
        return Ok(());
    }
    if let Some((commit_ts, write)) = reader.seek_write(&key, ferrokv_common::types::MAX_TS)? {
        if commit_ts >= start_ts {
            return Err(MvccError::WriteConflict {
                key: m.key.clone(),
                start_ts,
                conflict_start_ts: write.start_ts,
                conflict_commit_ts: commit_ts,
            });
        }
    }

    let (kind, short_value) = match m.op {
        Op::Put if m.value.len() <= SHORT_VALUE_MAX_LEN => (LockKind::Put, Some(m.value.clone())),
        Op::Put => {
            wb.put_cf(
                Cf::Default,
                key.clone().append_ts(start_ts).data_key(),
                m.value.clone(),
            );
            (LockKind::Put, None)
        }
        Op::Del => (LockKind::Delete, None),
        Op::Lock => (LockKind::Lock, None),
    };
    let lock = Lock::new(kind, primary.to_vec(), start_ts, ttl, short_value);
    wb.put_cf(Cf::Lock, key.data_key(), lock.to_bytes());
    Ok(())
}
