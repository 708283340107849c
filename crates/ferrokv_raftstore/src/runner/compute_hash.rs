//! Consistency-check hashes of a region's data at a given log index.

use ferrokv_common::{KvError, KvResult, Region};
use ferrokv_storage::engine::{Cf, Snapshot};
use ferrokv_storage::mvcc::codec::data_range;

use crate::msg::Msg;
use crate::router::Router;
use crate::task::{ComputeHashTask, Task};
use crate::worker::Runnable;

pub struct ComputeHashRunner {
    router: Router,
}

/// CRC32 over the region identity and every data CF entry in its range.
pub fn compute_region_hash(region: &Region, snap: &Snapshot) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&region.id.to_be_bytes());
    hasher.update(&region.start_key);
    hasher.update(&region.end_key);
    let (start, end) = data_range(&region.start_key, &region.end_key);
    for cf in Cf::DATA {
        hasher.update(cf.name().as_bytes());
        for (k, v) in snap.range_cf(cf, &start, Some(&end)) {
            hasher.update(&k);
            hasher.update(&v);
        }
    }
    hasher.finalize()
}

impl ComputeHashRunner {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    fn compute_hash(&self, task: ComputeHashTask) {
        let region_id = task.region.id;
        let hash = compute_region_hash(&task.region, &task.snap);
        tracing::debug!(region_id, index = task.index, hash, "region hash computed");
        let msg = Msg::ComputeHashResult {
            index: task.index,
            hash,
        };
        if let Err(e) = self.router.send(region_id, msg) {
            tracing::warn!(region_id, error = %e, "failed to deliver hash result");
        }
    }
}

impl Runnable for ComputeHashRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        match task {
            Task::ComputeHash(t) => {
                self.compute_hash(t);
                Ok(())
            }
            other => Err(KvError::Internal(format!(
                "compute hash worker got unexpected task {:?}",
                other
            ))),
        }
    }
}
