//! Deletion of applied raft log entries.

use ferrokv_common::{keys, KvError, KvResult};
use ferrokv_observability as obs;
use ferrokv_storage::engine::{Cf, WriteBatch};

use crate::task::{RaftLogGcTask, Task};
use crate::worker::Runnable;

#[derive(Default)]
pub struct RaftLogGcRunner;

impl RaftLogGcRunner {
    pub fn new() -> Self {
        Self
    }

    /// Delete logs `[start_idx, end_idx)`; returns how many existed.
    fn gc_raft_log(&self, task: &RaftLogGcTask) -> KvResult<u64> {
        if task.start_idx >= task.end_idx {
            return Ok(0);
        }
        let start = keys::raft_log_key(task.region_id, task.start_idx);
        let end = keys::raft_log_key(task.region_id, task.end_idx);
        let engine = &task.raft_engine;
        let count = engine
            .snapshot()
            .range_cf(Cf::Raft, &start, Some(&end))
            .count() as u64;
        if count == 0 {
            return Ok(0);
        }
        let mut wb = WriteBatch::new();
        wb.delete_range_cf(Cf::Raft, start.clone(), end.clone());
        engine.write(&wb)?;
        let removed = engine.compact_range_cf(Cf::Raft, Some(&start), Some(&end));
        obs::record_compaction("raft_log_gc", removed);
        Ok(count)
    }
}

impl Runnable for RaftLogGcRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        match task {
            Task::RaftLogGc(t) => {
                let collected = self.gc_raft_log(&t)?;
                tracing::debug!(
                    region_id = t.region_id,
                    start_idx = t.start_idx,
                    end_idx = t.end_idx,
                    collected,
                    "raft log gc"
                );
                Ok(())
            }
            other => Err(KvError::Internal(format!(
                "raft log gc worker got unexpected task {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_storage::engine::{Engine, EngineOptions};
    use std::sync::Arc;

    fn raft_engine() -> Arc<Engine> {
        let engine = Arc::new(Engine::new_in_memory(EngineOptions::default()));
        let mut wb = WriteBatch::new();
        for region_id in [1, 2] {
            for idx in 1..=20 {
                wb.put_cf(Cf::Raft, keys::raft_log_key(region_id, idx), b"entry".to_vec());
            }
        }
        engine.write(&wb).unwrap();
        engine
    }

    #[test]
    fn test_gc_deletes_only_requested_range() {
        let engine = raft_engine();
        let runner = RaftLogGcRunner::new();
        let task = RaftLogGcTask {
            raft_engine: engine.clone(),
            region_id: 1,
            start_idx: 1,
            end_idx: 11,
        };
        assert_eq!(runner.gc_raft_log(&task).unwrap(), 10);
        assert!(engine.get_cf(Cf::Raft, &keys::raft_log_key(1, 10)).is_none());
        assert!(engine.get_cf(Cf::Raft, &keys::raft_log_key(1, 11)).is_some());
        assert!(engine.get_cf(Cf::Raft, &keys::raft_log_key(2, 5)).is_some());
        assert_eq!(engine.tombstone_count(), 0);
        // Second run finds nothing.
        assert_eq!(runner.gc_raft_log(&task).unwrap(), 0);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let engine = raft_engine();
        let mut runner = RaftLogGcRunner::new();
        runner
            .run(Task::RaftLogGc(RaftLogGcTask {
                raft_engine: engine.clone(),
                region_id: 1,
                start_idx: 5,
                end_idx: 5,
            }))
            .unwrap();
        assert!(engine.get_cf(Cf::Raft, &keys::raft_log_key(1, 5)).is_some());
    }
}
