//! Split-key discovery for oversized regions.
//!
//! [`SplitCheckerHost`] decides whether a region needs checking at all and
//! picks a [`SplitKeyFinder`]. `Scan` walks every committed version in the
//! region; `Approximate` reads the sampled range properties and falls back
//! to `Scan` when there are too few samples.

use std::sync::Arc;

use ferrokv_common::config::{SplitCheckConfig, SplitCheckPolicy};
use ferrokv_common::{KvError, KvResult, MvccError, Region};
use ferrokv_observability as obs;
use ferrokv_storage::engine::{Cf, Engine};
use ferrokv_storage::mvcc::codec::{data_range, split_data_key};
use ferrokv_storage::mvcc::{Write, WriteKind};
use thiserror::Error;

use crate::msg::Msg;
use crate::router::Router;
use crate::task::{SplitCheckTask, Task};
use crate::worker::Runnable;

/// Fewest samples the approximate finder accepts.
const MIN_APPROXIMATE_SAMPLES: usize = 2;

#[derive(Debug, Error)]
pub enum SplitCheckError {
    #[error("approximate split check needs {required} samples, got {got}")]
    NotEnoughSamples { got: usize, required: usize },

    #[error(transparent)]
    Mvcc(#[from] MvccError),
}

impl From<SplitCheckError> for KvError {
    fn from(e: SplitCheckError) -> Self {
        match e {
            SplitCheckError::Mvcc(e) => KvError::Mvcc(e),
            other => KvError::Internal(other.to_string()),
        }
    }
}

pub trait SplitKeyFinder {
    fn name(&self) -> &'static str;

    /// Raw split keys in ascending order, strictly inside the region.
    fn split_keys(
        &self,
        engine: &Engine,
        region: &Region,
        cfg: &SplitCheckConfig,
    ) -> Result<Vec<Vec<u8>>, SplitCheckError>;
}

pub struct ScanFinder;

impl SplitKeyFinder for ScanFinder {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn split_keys(
        &self,
        engine: &Engine,
        region: &Region,
        cfg: &SplitCheckConfig,
    ) -> Result<Vec<Vec<u8>>, SplitCheckError> {
        let (start, end) = data_range(&region.start_key, &region.end_key);
        let snap = engine.snapshot();
        let mut split_keys = Vec::new();
        let mut last_user_key = None;
        let (mut size, mut keys) = (0u64, 0u64);

        for (k, v) in snap.range_cf(Cf::Write, &start, Some(&end)) {
            let (user_key, _) = split_data_key(&k)?;
            if last_user_key.as_ref() != Some(&user_key) {
                if last_user_key.is_some()
                    && (size >= cfg.region_split_size || keys >= cfg.region_split_keys)
                {
                    split_keys.push(user_key.to_raw()?);
                    if split_keys.len() >= cfg.batch_split_limit {
                        break;
                    }
                    size = 0;
                    keys = 0;
                }
                keys += 1;
                last_user_key = Some(user_key.clone());
            }
            size += (k.len() + v.len()) as u64;

            let write = Write::parse(&v)?;
            if write.kind == WriteKind::Put && write.short_value.is_none() {
                let value_key = user_key.append_ts(write.start_ts).data_key();
                if let Some(value) = snap.get_cf(Cf::Default, &value_key) {
                    size += (value_key.len() + value.len()) as u64;
                }
            }
        }
        Ok(split_keys)
    }
}

pub struct ApproximateFinder;

impl SplitKeyFinder for ApproximateFinder {
    fn name(&self) -> &'static str {
        "approximate"
    }

    fn split_keys(
        &self,
        engine: &Engine,
        region: &Region,
        cfg: &SplitCheckConfig,
    ) -> Result<Vec<Vec<u8>>, SplitCheckError> {
        let (start, end) = data_range(&region.start_key, &region.end_key);
        let writes = engine.range_properties(Cf::Write, &start, Some(&end));
        let values = engine.range_properties(Cf::Default, &start, Some(&end));
        if writes.samples.len() < MIN_APPROXIMATE_SAMPLES {
            return Err(SplitCheckError::NotEnoughSamples {
                got: writes.samples.len(),
                required: MIN_APPROXIMATE_SAMPLES,
            });
        }

        // Long values live in the default CF; spread their size evenly
        // over the write CF samples.
        let total = writes.total_size + values.total_size;
        let scale = |cum: u64| -> u64 {
            if writes.total_size == 0 {
                cum
            } else {
                (cum as u128 * total as u128 / writes.total_size as u128) as u64
            }
        };
        let mut next_size = cfg.region_split_size;
        let mut next_keys = cfg.region_split_keys;
        let mut split_keys: Vec<Vec<u8>> = Vec::new();

        for sample in &writes.samples {
            let size = scale(sample.size);
            if size < next_size && sample.keys < next_keys {
                continue;
            }
            let raw = split_data_key(&sample.key)?.0.to_raw()?;
            if raw > region.start_key
                && region.contains_key(&raw)
                && split_keys.last() != Some(&raw)
            {
                split_keys.push(raw);
                if split_keys.len() >= cfg.batch_split_limit {
                    break;
                }
            }
            while next_size <= size {
                next_size += cfg.region_split_size;
            }
            while next_keys <= sample.keys {
                next_keys += cfg.region_split_keys;
            }
        }
        Ok(split_keys)
    }
}

/// Per-check state: the region's approximate footprint and the configured
/// strategy.
pub struct SplitCheckerHost<'a> {
    cfg: &'a SplitCheckConfig,
    auto_split: bool,
    policy: SplitCheckPolicy,
    approximate_size: u64,
    approximate_keys: u64,
}

impl<'a> SplitCheckerHost<'a> {
    pub fn new(
        engine: &Engine,
        region: &Region,
        auto_split: bool,
        policy: SplitCheckPolicy,
        cfg: &'a SplitCheckConfig,
    ) -> Self {
        let (start, end) = data_range(&region.start_key, &region.end_key);
        let writes = engine.range_properties(Cf::Write, &start, Some(&end));
        let values = engine.range_properties(Cf::Default, &start, Some(&end));
        Self {
            cfg,
            auto_split,
            policy,
            approximate_size: writes.total_size + values.total_size,
            approximate_keys: writes.num_keys,
        }
    }

    /// True when an automatic check can be skipped because the region is
    /// below both maximums.
    pub fn skip(&self) -> bool {
        self.auto_split
            && self.approximate_size < self.cfg.region_max_size
            && self.approximate_keys < self.cfg.region_max_keys
    }

    pub fn approximate_size(&self) -> u64 {
        self.approximate_size
    }

    pub fn approximate_keys(&self) -> u64 {
        self.approximate_keys
    }

    pub fn finder(&self) -> Box<dyn SplitKeyFinder> {
        match self.policy {
            SplitCheckPolicy::Scan => Box::new(ScanFinder),
            SplitCheckPolicy::Approximate => Box::new(ApproximateFinder),
        }
    }

    /// Run the configured finder, falling back to a scan when the
    /// approximate one lacks samples.
    pub fn split_keys(&self, engine: &Engine, region: &Region) -> KvResult<Vec<Vec<u8>>> {
        let finder = self.finder();
        let keys = match finder.split_keys(engine, region, self.cfg) {
            Ok(keys) => keys,
            Err(SplitCheckError::NotEnoughSamples { got, required }) => {
                tracing::info!(
                    region_id = region.id,
                    got,
                    required,
                    "approximate split check lacks samples, falling back to scan"
                );
                ScanFinder.split_keys(engine, region, self.cfg)?
            }
            Err(e) => return Err(e.into()),
        };
        obs::record_split_check(finder.name(), keys.len());
        Ok(keys)
    }
}

pub struct SplitCheckRunner {
    engine: Arc<Engine>,
    router: Router,
    cfg: SplitCheckConfig,
}

impl SplitCheckRunner {
    pub fn new(engine: Arc<Engine>, router: Router, cfg: SplitCheckConfig) -> Self {
        Self {
            engine,
            router,
            cfg,
        }
    }

    fn check(&self, task: SplitCheckTask) -> KvResult<()> {
        let region = &task.region;
        let host = SplitCheckerHost::new(
            &self.engine,
            region,
            task.auto_split,
            task.policy,
            &self.cfg,
        );
        if host.skip() {
            tracing::debug!(
                region_id = region.id,
                size = host.approximate_size(),
                keys = host.approximate_keys(),
                "region below split thresholds, skip"
            );
            return Ok(());
        }
        let split_keys = host.split_keys(&self.engine, region)?;
        if split_keys.is_empty() {
            tracing::debug!(region_id = region.id, "no split key found");
            return Ok(());
        }
        tracing::info!(
            region_id = region.id,
            count = split_keys.len(),
            size = host.approximate_size(),
            "split keys found"
        );
        let msg = Msg::SplitRegion {
            region_epoch: region.region_epoch,
            split_keys,
            callback: None,
        };
        if let Err(e) = self.router.send(region.id, msg) {
            tracing::warn!(region_id = region.id, error = %e, "failed to send split request");
        }
        Ok(())
    }
}

impl Runnable for SplitCheckRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        match task {
            Task::SplitCheck(t) => self.check(t),
            other => Err(KvError::Internal(format!(
                "split check worker got unexpected task {:?}",
                other
            ))),
        }
    }
}
