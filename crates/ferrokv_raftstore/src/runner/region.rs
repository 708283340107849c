//! Region data jobs: snapshot generation and application, and the removal
//! of a destroyed region's data.
//!
//! Applies are queued and only executed while the engine is not
//! write-stalled; the queue is re-examined on every task and on idle ticks.

use std::collections::VecDeque;
use std::sync::Arc;

use ferrokv_common::{KvError, KvResult, RegionId};
use ferrokv_observability as obs;
use ferrokv_storage::engine::{Cf, Engine, WriteBatch};
use ferrokv_storage::mvcc::codec::data_range;

use crate::snap::{JobState, JobStatus, RegionSnapshot};
use crate::task::{RegionTask, Task};
use crate::worker::Runnable;

struct PendingApply {
    region_id: RegionId,
    status: JobStatus,
    snapshot: RegionSnapshot,
}

pub struct RegionRunner {
    engine: Arc<Engine>,
    /// Keys deleted per write batch when destroying a region.
    batch_size: usize,
    pending_applies: VecDeque<PendingApply>,
}

impl RegionRunner {
    pub fn new(engine: Arc<Engine>, batch_size: usize) -> Self {
        Self {
            engine,
            batch_size: batch_size.max(1),
            pending_applies: VecDeque::new(),
        }
    }

    pub fn pending_applies(&self) -> usize {
        self.pending_applies.len()
    }

    fn handle_generate(
        &self,
        region_id: RegionId,
        start_key: &[u8],
        end_key: &[u8],
        status: JobStatus,
        notifier: std::sync::mpsc::SyncSender<RegionSnapshot>,
    ) -> KvResult<()> {
        if !status.transition(JobState::Pending, JobState::Running) {
            tracing::info!(region_id, state = ?status.state(), "generate job not pending, skip");
            obs::record_snapshot_job("generate", "skipped");
            return Ok(());
        }
        let snapshot = RegionSnapshot::build(region_id, start_key, end_key, &self.engine.snapshot());
        tracing::info!(region_id, entries = snapshot.len(), "region snapshot generated");
        status.set(JobState::Finished);
        obs::record_snapshot_job("generate", "finished");
        if notifier.send(snapshot).is_err() {
            tracing::warn!(region_id, "snapshot receiver dropped");
        }
        Ok(())
    }

    fn handle_pending_applies(&mut self) {
        while !self.pending_applies.is_empty() {
            if self.engine.is_write_stalled() {
                obs::record_engine_stall(true);
                tracing::debug!(
                    pending = self.pending_applies.len(),
                    tombstones = self.engine.tombstone_count(),
                    "engine stalled, delaying snapshot apply"
                );
                return;
            }
            if let Some(job) = self.pending_applies.pop_front() {
                if let Err(e) = self.apply(&job) {
                    tracing::warn!(region_id = job.region_id, error = %e, "snapshot apply failed");
                }
            }
        }
    }

    fn apply(&self, job: &PendingApply) -> KvResult<()> {
        let region_id = job.region_id;
        if !job.status.transition(JobState::Pending, JobState::Running) {
            tracing::info!(region_id, state = ?job.status.state(), "apply job not pending, skip");
            obs::record_snapshot_job("apply", "skipped");
            return Ok(());
        }
        let snap = &job.snapshot;
        if !snap.verify() {
            job.status.set(JobState::Failed);
            obs::record_snapshot_job("apply", "failed");
            return Err(KvError::Internal(format!(
                "snapshot of region {} failed checksum",
                region_id
            )));
        }

        let (start, end) = data_range(&snap.start_key, &snap.end_key);
        let mut wb = WriteBatch::new();
        for cf in Cf::DATA {
            wb.delete_range_cf(cf, start.clone(), end.clone());
        }
        for e in &snap.entries {
            wb.put_cf(e.cf, e.key.clone(), e.value.clone());
        }
        if let Err(e) = self.engine.write(&wb) {
            job.status.set(JobState::Failed);
            obs::record_snapshot_job("apply", "failed");
            return Err(e.into());
        }
        job.status.set(JobState::Finished);
        obs::record_snapshot_job("apply", "finished");
        tracing::info!(region_id, entries = snap.len(), "region snapshot applied");
        Ok(())
    }

    fn handle_destroy(&self, region_id: RegionId, start_key: &[u8], end_key: &[u8]) -> KvResult<()> {
        let (start, end) = data_range(start_key, end_key);
        let mut deleted = 0usize;
        for cf in Cf::DATA {
            loop {
                let snap = self.engine.snapshot();
                let keys: Vec<Vec<u8>> = snap
                    .range_cf(cf, &start, Some(&end))
                    .take(self.batch_size)
                    .map(|(k, _)| k)
                    .collect();
                if keys.is_empty() {
                    break;
                }
                let mut wb = WriteBatch::new();
                deleted += keys.len();
                for k in keys {
                    wb.delete_cf(cf, k);
                }
                self.engine.write(&wb)?;
            }
        }
        obs::record_snapshot_job("destroy", "finished");
        tracing::info!(region_id, deleted, "region data destroyed");
        Ok(())
    }
}

impl Runnable for RegionRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        let res = match task {
            Task::Region(RegionTask::Generate {
                region_id,
                start_key,
                end_key,
                status,
                notifier,
            }) => self.handle_generate(region_id, &start_key, &end_key, status, notifier),
            Task::Region(RegionTask::Apply {
                region_id,
                status,
                snapshot,
            }) => {
                self.pending_applies.push_back(PendingApply {
                    region_id,
                    status,
                    snapshot,
                });
                Ok(())
            }
            Task::Region(RegionTask::Destroy {
                region_id,
                start_key,
                end_key,
            }) => self.handle_destroy(region_id, &start_key, &end_key),
            other => Err(KvError::Internal(format!(
                "region worker got unexpected task {:?}",
                other
            ))),
        };
        self.handle_pending_applies();
        res
    }

    fn on_tick(&mut self) {
        self.handle_pending_applies();
    }

    fn shutdown(&mut self) {
        for job in self.pending_applies.drain(..) {
            job.status.cancel();
            tracing::info!(region_id = job.region_id, "pending snapshot apply cancelled");
        }
    }
}
