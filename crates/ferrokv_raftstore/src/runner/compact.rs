//! Tombstone compaction, either of an explicit range or of the ranges whose
//! tombstone counts cross the configured thresholds.

use std::sync::Arc;

use ferrokv_common::{KvError, KvResult};
use ferrokv_observability as obs;
use ferrokv_storage::engine::{Cf, Engine};

use crate::task::{CheckAndCompactTask, CompactTask, KeyRange, Task};
use crate::worker::Runnable;

/// CFs whose tombstones CheckAndCompact inspects and removes.
const CHECK_CFS: [Cf; 2] = [Cf::Write, Cf::Default];

pub struct CompactRunner {
    engine: Arc<Engine>,
}

impl CompactRunner {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn compact(&self, task: CompactTask) -> u64 {
        let removed = self.engine.compact_range_cf(
            task.cf,
            task.start_key.as_deref(),
            task.end_key.as_deref(),
        );
        obs::record_compaction("manual", removed);
        tracing::info!(cf = %task.cf, removed, "range compacted");
        removed
    }

    fn check_and_compact(&self, task: CheckAndCompactTask) -> u64 {
        let ranges = collect_ranges_need_compact(
            &self.engine,
            &task.ranges,
            task.tombstone_num_threshold,
            task.tombstone_percent_threshold,
        );
        let mut removed = 0;
        for range in &ranges {
            for cf in CHECK_CFS {
                removed +=
                    self.engine
                        .compact_range_cf(cf, Some(&range.start), Some(&range.end));
            }
        }
        if !ranges.is_empty() {
            obs::record_compaction("tombstones", removed);
            tracing::info!(
                checked = task.ranges.len(),
                compacted = ranges.len(),
                removed,
                "compacted ranges with many tombstones"
            );
        }
        removed
    }
}

/// Ranges whose tombstones reach both `num_threshold` and
/// `percent_threshold` percent of all entries.
pub fn collect_ranges_need_compact(
    engine: &Engine,
    ranges: &[KeyRange],
    num_threshold: u64,
    percent_threshold: u64,
) -> Vec<KeyRange> {
    ranges
        .iter()
        .filter(|r| {
            let (mut entries, mut deletes) = (0, 0);
            for cf in CHECK_CFS {
                let props = engine.range_properties(cf, &r.start, Some(&r.end));
                entries += props.num_entries;
                deletes += props.num_deletes;
            }
            entries > 0 && deletes >= num_threshold && deletes * 100 >= percent_threshold * entries
        })
        .cloned()
        .collect()
}

impl Runnable for CompactRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        match task {
            Task::Compact(t) => {
                self.compact(t);
                Ok(())
            }
            Task::CheckAndCompact(t) => {
                self.check_and_compact(t);
                Ok(())
            }
            other => Err(KvError::Internal(format!(
                "compact worker got unexpected task {:?}",
                other
            ))),
        }
    }
}
