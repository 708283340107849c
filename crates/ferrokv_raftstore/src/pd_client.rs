//! Placement-driver (cluster manager) client interface and an in-process
//! implementation used by single-node deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ferrokv_common::error::ClusterError;
use ferrokv_common::{Peer, PeerId, Region, RegionId, Store, StoreId};
use parking_lot::RwLock;

/// Ids allocated for one new region produced by a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitId {
    pub new_region_id: RegionId,
    /// One new peer id per peer of the parent region, in the same order.
    pub new_peer_ids: Vec<PeerId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub read_bytes: u64,
    pub read_keys: u64,
}

impl FlowStats {
    pub fn add(&mut self, other: &FlowStats) {
        self.read_bytes += other.read_bytes;
        self.read_keys += other.read_keys;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionHeartbeat {
    pub region: Region,
    pub leader: Peer,
    pub down_peers: Vec<Peer>,
    pub pending_peers: Vec<Peer>,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    pub approximate_size: u64,
    pub approximate_keys: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub store_id: StoreId,
    pub capacity: u64,
    pub available: u64,
    pub used_size: u64,
    pub region_count: u64,
    pub bytes_read: u64,
    pub keys_read: u64,
}

pub trait PdClient: Send + Sync {
    fn cluster_id(&self) -> u64;
    fn alloc_id(&self) -> Result<u64, ClusterError>;
    fn is_cluster_bootstrapped(&self) -> Result<bool, ClusterError>;
    fn bootstrap_cluster(&self, store: &Store, region: &Region) -> Result<(), ClusterError>;
    fn put_store(&self, store: &Store) -> Result<(), ClusterError>;
    fn get_region_by_id(&self, region_id: RegionId) -> Result<Option<Region>, ClusterError>;
    fn ask_split(&self, region: &Region) -> Result<SplitId, ClusterError>;
    fn ask_batch_split(&self, region: &Region, count: usize) -> Result<Vec<SplitId>, ClusterError>;
    fn region_heartbeat(&self, hb: &RegionHeartbeat) -> Result<(), ClusterError>;
    fn store_heartbeat(&self, stats: &StoreStats) -> Result<(), ClusterError>;
    fn report_batch_split(&self, regions: &[Region]) -> Result<(), ClusterError>;
}

/// Cluster manager living inside the node process.
pub struct LocalPdClient {
    cluster_id: u64,
    next_id: AtomicU64,
    bootstrapped: AtomicBool,
    stores: RwLock<HashMap<StoreId, Store>>,
    regions: RwLock<HashMap<RegionId, Region>>,
    heartbeats: RwLock<HashMap<RegionId, RegionHeartbeat>>,
    store_stats: RwLock<HashMap<StoreId, StoreStats>>,
}

impl LocalPdClient {
    pub fn new(cluster_id: u64) -> Self {
        Self {
            cluster_id,
            next_id: AtomicU64::new(1),
            bootstrapped: AtomicBool::new(false),
            stores: RwLock::new(HashMap::new()),
            regions: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
            store_stats: RwLock::new(HashMap::new()),
        }
    }

    /// Ids at or below `id` will never be allocated.
    pub fn reserve_ids_up_to(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self, region_id: RegionId) -> Option<RegionHeartbeat> {
        self.heartbeats.read().get(&region_id).cloned()
    }

    pub fn last_store_stats(&self, store_id: StoreId) -> Option<StoreStats> {
        self.store_stats.read().get(&store_id).cloned()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Record `region` if its epoch is not older than what is known. Ids
    /// seen in a report are never handed out again.
    fn observe_region(&self, region: &Region) {
        self.reserve_ids_up_to(region.id);
        for p in &region.peers {
            self.reserve_ids_up_to(p.id);
        }
        let mut regions = self.regions.write();
        match regions.get(&region.id) {
            Some(known) if region.region_epoch.is_stale_against(&known.region_epoch) => {
                tracing::debug!(region_id = region.id, "ignoring stale region report");
            }
            _ => {
                regions.insert(region.id, region.clone());
            }
        }
    }

    fn check_bootstrapped(&self) -> Result<(), ClusterError> {
        if self.bootstrapped.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClusterError::NotBootstrapped)
        }
    }
}

impl PdClient for LocalPdClient {
    fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    fn alloc_id(&self) -> Result<u64, ClusterError> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn is_cluster_bootstrapped(&self) -> Result<bool, ClusterError> {
        Ok(self.bootstrapped.load(Ordering::SeqCst))
    }

    fn bootstrap_cluster(&self, store: &Store, region: &Region) -> Result<(), ClusterError> {
        if self
            .bootstrapped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClusterError::AlreadyBootstrapped);
        }
        self.reserve_ids_up_to(store.id.max(region.id));
        for p in &region.peers {
            self.reserve_ids_up_to(p.id);
        }
        self.stores.write().insert(store.id, store.clone());
        self.regions.write().insert(region.id, region.clone());
        tracing::info!(cluster_id = self.cluster_id, store_id = store.id, region_id = region.id, "cluster bootstrapped");
        Ok(())
    }

    fn put_store(&self, store: &Store) -> Result<(), ClusterError> {
        self.check_bootstrapped()?;
        self.stores.write().insert(store.id, store.clone());
        Ok(())
    }

    fn get_region_by_id(&self, region_id: RegionId) -> Result<Option<Region>, ClusterError> {
        Ok(self.regions.read().get(&region_id).cloned())
    }

    fn ask_split(&self, region: &Region) -> Result<SplitId, ClusterError> {
        self.check_bootstrapped()?;
        let known = self
            .regions
            .read()
            .get(&region.id)
            .cloned()
            .ok_or(ClusterError::RegionNotFound(region.id))?;
        if region.region_epoch.is_stale_against(&known.region_epoch) {
            return Err(ClusterError::StaleRegion {
                region_id: region.id,
                reason: format!(
                    "epoch {:?} older than {:?}",
                    region.region_epoch, known.region_epoch
                ),
            });
        }
        let new_region_id = self.alloc_id()?;
        let new_peer_ids = region
            .peers
            .iter()
            .map(|_| self.alloc_id())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SplitId {
            new_region_id,
            new_peer_ids,
        })
    }

    fn ask_batch_split(&self, region: &Region, count: usize) -> Result<Vec<SplitId>, ClusterError> {
        (0..count).map(|_| self.ask_split(region)).collect()
    }

    fn region_heartbeat(&self, hb: &RegionHeartbeat) -> Result<(), ClusterError> {
        self.check_bootstrapped()?;
        self.observe_region(&hb.region);
        self.heartbeats.write().insert(hb.region.id, hb.clone());
        Ok(())
    }

    fn store_heartbeat(&self, stats: &StoreStats) -> Result<(), ClusterError> {
        self.check_bootstrapped()?;
        if !self.stores.read().contains_key(&stats.store_id) {
            return Err(ClusterError::Unavailable(format!(
                "store {} not registered",
                stats.store_id
            )));
        }
        self.store_stats.write().insert(stats.store_id, stats.clone());
        Ok(())
    }

    fn report_batch_split(&self, regions: &[Region]) -> Result<(), ClusterError> {
        self.check_bootstrapped()?;
        for r in regions {
            self.observe_region(r);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_common::RegionEpoch;

    fn region(id: u64, version: u64) -> Region {
        Region {
            id,
            start_key: vec![],
            end_key: vec![],
            region_epoch: RegionEpoch::new(1, version),
            peers: vec![Peer { id: 3, store_id: 1 }],
        }
    }

    fn bootstrapped() -> LocalPdClient {
        let pd = LocalPdClient::new(1);
        let store = Store {
            id: 1,
            address: "127.0.0.1:20160".into(),
        };
        pd.bootstrap_cluster(&store, &region(2, 1)).unwrap();
        pd
    }

    #[test]
    fn test_bootstrap_once() {
        let pd = bootstrapped();
        assert!(pd.is_cluster_bootstrapped().unwrap());
        let store = Store::default();
        assert_eq!(
            pd.bootstrap_cluster(&store, &region(9, 1)),
            Err(ClusterError::AlreadyBootstrapped)
        );
        // Ids allocated after bootstrap never collide with bootstrap ids.
        assert!(pd.alloc_id().unwrap() > 3);
    }

    #[test]
    fn test_ask_split_allocates_peer_ids() {
        let pd = bootstrapped();
        let ids = pd.ask_batch_split(&region(2, 1), 2).unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0].new_region_id, ids[1].new_region_id);
        assert_eq!(ids[0].new_peer_ids.len(), 1);
    }

    #[test]
    fn test_stale_split_rejected() {
        let pd = bootstrapped();
        pd.report_batch_split(&[region(2, 5)]).unwrap();
        let err = pd.ask_split(&region(2, 1)).unwrap_err();
        assert!(matches!(err, ClusterError::StaleRegion { region_id: 2, .. }));
        assert!(matches!(
            pd.ask_split(&region(42, 1)),
            Err(ClusterError::RegionNotFound(42))
        ));
    }

    #[test]
    fn test_heartbeats_recorded() {
        let pd = bootstrapped();
        let hb = RegionHeartbeat {
            region: region(2, 3),
            approximate_size: 100,
            ..Default::default()
        };
        pd.region_heartbeat(&hb).unwrap();
        assert_eq!(pd.last_heartbeat(2).unwrap().approximate_size, 100);
        assert_eq!(pd.get_region_by_id(2).unwrap().unwrap().region_epoch.version, 3);

        let stats = StoreStats {
            store_id: 1,
            used_size: 10,
            ..Default::default()
        };
        pd.store_heartbeat(&stats).unwrap();
        assert_eq!(pd.last_store_stats(1).unwrap().used_size, 10);
        assert!(pd
            .store_heartbeat(&StoreStats {
                store_id: 77,
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_reported_ids_are_reserved() {
        let pd = bootstrapped();
        let mut r = region(50, 2);
        r.peers[0].id = 51;
        pd.report_batch_split(&[r]).unwrap();
        assert!(pd.alloc_id().unwrap() > 51);
        assert_eq!(pd.region_count(), 2);
    }

    #[test]
    fn test_not_bootstrapped() {
        let pd = LocalPdClient::new(1);
        assert_eq!(
            pd.region_heartbeat(&RegionHeartbeat::default()),
            Err(ClusterError::NotBootstrapped)
        );
    }
}
