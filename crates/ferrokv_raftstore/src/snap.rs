//! Replication snapshots of a region's data and the job status shared
//! between the requester and the region worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use ferrokv_common::RegionId;
use ferrokv_storage::engine::{Cf, Snapshot};
use ferrokv_storage::mvcc::codec::data_range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapEntry {
    pub cf: Cf,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Point-in-time copy of every data column family within a region's range.
#[derive(Debug, Clone)]
pub struct RegionSnapshot {
    pub region_id: RegionId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub entries: Vec<SnapEntry>,
    pub checksum: u32,
}

impl RegionSnapshot {
    /// Copy `[start_key, end_key)` (raw region bounds) out of `snap`.
    pub fn build(region_id: RegionId, start_key: &[u8], end_key: &[u8], snap: &Snapshot) -> Self {
        let (start, end) = data_range(start_key, end_key);
        let mut entries = Vec::new();
        for cf in Cf::DATA {
            for (k, v) in snap.range_cf(cf, &start, Some(&end)) {
                entries.push(SnapEntry { cf, key: k, value: v });
            }
        }
        let checksum = checksum_of(&entries);
        Self {
            region_id,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            entries,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        checksum_of(&self.entries) == self.checksum
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn checksum_of(entries: &[SnapEntry]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for e in entries {
        hasher.update(e.cf.name().as_bytes());
        hasher.update(&(e.key.len() as u32).to_le_bytes());
        hasher.update(&e.key);
        hasher.update(&(e.value.len() as u32).to_le_bytes());
        hasher.update(&e.value);
    }
    hasher.finalize()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Running = 1,
    Cancelled = 2,
    Finished = 3,
    Failed = 4,
}

impl JobState {
    fn from_u8(v: u8) -> JobState {
        match v {
            0 => JobState::Pending,
            1 => JobState::Running,
            2 => JobState::Cancelled,
            3 => JobState::Finished,
            _ => JobState::Failed,
        }
    }
}

/// Shared status of a snapshot job. Cloning shares the state.
#[derive(Debug, Clone)]
pub struct JobStatus(Arc<AtomicU8>);

impl JobStatus {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(JobState::Pending as u8)))
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: JobState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically move `from -> to`; false if the job was not in `from`.
    pub fn transition(&self, from: JobState, to: JobState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Cancel a job that has not started yet.
    pub fn cancel(&self) -> bool {
        self.transition(JobState::Pending, JobState::Cancelled)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_storage::engine::{Engine, EngineOptions};
    use ferrokv_storage::mvcc::Key;

    #[test]
    fn test_build_covers_only_region_range() {
        let engine = Engine::new_in_memory(EngineOptions::default());
        for k in [&b"a"[..], b"c", b"e"] {
            engine
                .put_cf(Cf::Write, &Key::from_raw(k).append_ts(5).data_key(), b"w")
                .unwrap();
        }
        engine
            .put_cf(Cf::Lock, &Key::from_raw(b"c").data_key(), b"l")
            .unwrap();
        let snap = RegionSnapshot::build(1, b"b", b"e", &engine.snapshot());
        assert_eq!(snap.len(), 2);
        assert!(snap.verify());
    }

    #[test]
    fn test_tampered_snapshot_fails_verify() {
        let engine = Engine::new_in_memory(EngineOptions::default());
        engine
            .put_cf(Cf::Default, &Key::from_raw(b"k").append_ts(1).data_key(), b"v")
            .unwrap();
        let mut snap = RegionSnapshot::build(1, b"", b"", &engine.snapshot());
        snap.entries[0].value = b"x".to_vec();
        assert!(!snap.verify());
    }

    #[test]
    fn test_job_status_transitions() {
        let status = JobStatus::new();
        let shared = status.clone();
        assert_eq!(status.state(), JobState::Pending);
        assert!(shared.transition(JobState::Pending, JobState::Running));
        assert!(!status.cancel());
        status.set(JobState::Finished);
        assert_eq!(shared.state(), JobState::Finished);

        let other = JobStatus::new();
        assert!(other.cancel());
        assert_eq!(other.state(), JobState::Cancelled);
    }
}
