//! Calls to the cluster manager. Every request is fire-and-forget from the
//! region's point of view: results come back through callbacks or messages.

use std::collections::HashMap;
use std::sync::Arc;

use ferrokv_common::error::ClusterError;
use ferrokv_common::{KvError, KvResult, Peer, Region, RegionId, StoreId};
use ferrokv_storage::engine::Engine;

use crate::msg::Msg;
use crate::pd_client::{FlowStats, PdClient, RegionHeartbeat, StoreStats};
use crate::router::Router;
use crate::task::{AskSplitCallback, PdTask, Task};
use crate::worker::Runnable;

pub struct PdRunner {
    store_id: StoreId,
    pd_client: Arc<dyn PdClient>,
    router: Router,
    region_reads: HashMap<RegionId, FlowStats>,
    store_reads: FlowStats,
}

impl PdRunner {
    pub fn new(store_id: StoreId, pd_client: Arc<dyn PdClient>, router: Router) -> Self {
        Self {
            store_id,
            pd_client,
            router,
            region_reads: HashMap::new(),
            store_reads: FlowStats::default(),
        }
    }

    fn handle_ask_split(
        &self,
        region: Region,
        split_keys: Vec<Vec<u8>>,
        peer: Peer,
        right_derive: bool,
        callback: AskSplitCallback,
    ) {
        if split_keys.is_empty() {
            callback(Err(ClusterError::StaleRegion {
                region_id: region.id,
                reason: "no split keys".into(),
            }));
            return;
        }
        let res = if split_keys.len() == 1 {
            self.pd_client.ask_split(&region).map(|id| vec![id])
        } else {
            self.pd_client.ask_batch_split(&region, split_keys.len())
        };
        match &res {
            Ok(ids) => tracing::info!(
                region_id = region.id,
                peer_id = peer.id,
                right_derive,
                new_regions = ?ids.iter().map(|i| i.new_region_id).collect::<Vec<_>>(),
                "split ids allocated"
            ),
            Err(e) => tracing::warn!(region_id = region.id, error = %e, "ask split failed"),
        }
        callback(res);
    }

    fn handle_heartbeat(&mut self, mut hb: RegionHeartbeat) -> KvResult<()> {
        if let Some(reads) = self.region_reads.remove(&hb.region.id) {
            hb.read_bytes += reads.read_bytes;
            hb.read_keys += reads.read_keys;
        }
        self.pd_client.region_heartbeat(&hb)?;
        Ok(())
    }

    fn handle_store_heartbeat(
        &mut self,
        mut stats: StoreStats,
        engine: &Engine,
        capacity: u64,
    ) -> KvResult<()> {
        let used = engine.used_size();
        stats.store_id = self.store_id;
        stats.used_size = used;
        if capacity == 0 {
            stats.capacity = 0;
            stats.available = u64::MAX;
        } else {
            stats.capacity = capacity;
            stats.available = capacity.saturating_sub(used);
        }
        stats.bytes_read = self.store_reads.read_bytes;
        stats.keys_read = self.store_reads.read_keys;
        self.pd_client.store_heartbeat(&stats)?;
        self.store_reads = FlowStats::default();

        // Regions destroyed since their last heartbeat never drain their reads.
        let before = self.region_reads.len();
        self.region_reads
            .retain(|region_id, _| self.router.is_registered(*region_id));
        let dropped = before - self.region_reads.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped read stats of departed regions");
        }
        Ok(())
    }

    fn handle_validate_peer(
        &self,
        local: Region,
        peer: Peer,
        merge_source: Option<RegionId>,
    ) -> KvResult<()> {
        let Some(pd_region) = self.pd_client.get_region_by_id(local.id)? else {
            tracing::warn!(region_id = local.id, ?merge_source, "region unknown to cluster manager");
            return Ok(());
        };
        if !local.region_epoch.is_stale_against(&pd_region.region_epoch) {
            return Ok(());
        }
        if pd_region.peers.iter().any(|p| p.id == peer.id) {
            tracing::debug!(region_id = local.id, peer_id = peer.id, "peer still valid");
            return Ok(());
        }
        tracing::info!(
            region_id = local.id,
            peer_id = peer.id,
            local_epoch = ?local.region_epoch,
            pd_epoch = ?pd_region.region_epoch,
            "peer removed from region, reporting stale"
        );
        if let Err(e) = self.router.send(local.id, Msg::StalePeer { peer }) {
            tracing::warn!(region_id = local.id, error = %e, "failed to report stale peer");
        }
        Ok(())
    }

    fn handle_read_stats(&mut self, stats: HashMap<RegionId, FlowStats>) {
        for (region_id, s) in stats {
            self.store_reads.add(&s);
            self.region_reads.entry(region_id).or_default().add(&s);
        }
    }
}

impl Runnable for PdRunner {
    fn run(&mut self, task: Task) -> KvResult<()> {
        let task = match task {
            Task::Pd(t) => t,
            other => {
                return Err(KvError::Internal(format!(
                    "pd worker got unexpected task {:?}",
                    other
                )))
            }
        };
        match task {
            PdTask::AskSplit {
                region,
                split_key,
                peer,
                right_derive,
                callback,
            } => {
                self.handle_ask_split(region, vec![split_key], peer, right_derive, callback);
                Ok(())
            }
            PdTask::AskBatchSplit {
                region,
                split_keys,
                peer,
                right_derive,
                callback,
            } => {
                self.handle_ask_split(region, split_keys, peer, right_derive, callback);
                Ok(())
            }
            PdTask::Heartbeat(hb) => self.handle_heartbeat(hb),
            PdTask::StoreHeartbeat {
                stats,
                engine,
                capacity,
            } => self.handle_store_heartbeat(stats, &engine, capacity),
            PdTask::ReportBatchSplit { regions } => {
                self.pd_client.report_batch_split(&regions)?;
                Ok(())
            }
            PdTask::ValidatePeer {
                region,
                peer,
                merge_source,
            } => self.handle_validate_peer(region, peer, merge_source),
            PdTask::ReadStats(stats) => {
                self.handle_read_stats(stats);
                Ok(())
            }
        }
    }
}
