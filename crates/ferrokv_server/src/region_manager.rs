//! The node's authoritative region map.
//!
//! Every mutation (`bootstrap`, `apply_split`, `remove`) persists the
//! affected region metadata under `internal\region<id>` in one engine batch
//! and then updates the in-memory map while holding its write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use ferrokv_common::error::{EngineError, RegionError};
use ferrokv_common::{keys, KvError, KvResult, Peer, Region, RegionEpoch, RegionId, Store};
use ferrokv_raftstore::SplitId;
use ferrokv_storage::engine::{Cf, Engine, WriteBatch};
use parking_lot::RwLock;

/// Column family holding node-local metadata.
const META_CF: Cf = Cf::Default;

pub struct RegionManager {
    engine: Arc<Engine>,
    regions: RwLock<BTreeMap<RegionId, Region>>,
}

fn encode<T: serde::Serialize>(v: &T) -> KvResult<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| EngineError::Serialization(e.to_string()).into())
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> KvResult<T> {
    serde_json::from_slice(raw).map_err(|e| EngineError::Serialization(e.to_string()).into())
}

pub fn load_store(engine: &Engine) -> KvResult<Option<Store>> {
    engine
        .get_cf(META_CF, keys::STORE_META_KEY)
        .map(|raw| decode(&raw))
        .transpose()
}

pub fn save_store(engine: &Engine, store: &Store) -> KvResult<()> {
    engine.put_cf(META_CF, keys::STORE_META_KEY, &encode(store)?)?;
    Ok(())
}

impl RegionManager {
    /// Rebuild the map from the persisted region metadata.
    pub fn load(engine: Arc<Engine>) -> KvResult<Self> {
        let mut regions = BTreeMap::new();
        {
            let snap = engine.snapshot();
            let mut upper = keys::REGION_META_PREFIX.to_vec();
            upper.push(0xFF);
            for (k, v) in snap.range_cf(META_CF, keys::REGION_META_PREFIX, Some(&upper)) {
                let Some(id) = keys::region_id_from_meta_key(&k) else {
                    tracing::warn!(key = ?k, "skipping malformed region meta key");
                    continue;
                };
                let region: Region = decode(&v)?;
                if region.id != id {
                    return Err(KvError::Internal(format!(
                        "region meta key {} holds region {}",
                        id, region.id
                    )));
                }
                regions.insert(id, region);
            }
        }
        tracing::info!(regions = regions.len(), "region meta loaded");
        Ok(Self {
            engine,
            regions: RwLock::new(regions),
        })
    }

    pub fn get(&self, region_id: RegionId) -> Option<Region> {
        self.regions.read().get(&region_id).cloned()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.regions.read().values().cloned().collect()
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Region serving `key`, if this node has one.
    pub fn find_by_key(&self, key: &[u8]) -> Option<Region> {
        self.regions
            .read()
            .values()
            .find(|r| r.contains_key(key))
            .cloned()
    }

    /// Install the first region of a fresh store.
    pub fn bootstrap(&self, region: Region) -> KvResult<()> {
        let mut regions = self.regions.write();
        if regions.contains_key(&region.id) {
            return Err(KvError::Internal(format!(
                "region {} already exists",
                region.id
            )));
        }
        let mut wb = WriteBatch::new();
        wb.put_cf(META_CF, keys::region_meta_key(region.id), encode(&region)?);
        self.engine.write(&wb)?;
        tracing::info!(region_id = region.id, "region bootstrapped");
        regions.insert(region.id, region);
        Ok(())
    }

    /// Split `region_id` at `split_keys`, returning the regions left to
    /// right. The original region keeps its id and the leftmost range; each
    /// new region takes one entry of `split_ids`.
    pub fn apply_split(
        &self,
        region_id: RegionId,
        expected_epoch: RegionEpoch,
        split_keys: &[Vec<u8>],
        split_ids: &[SplitId],
    ) -> KvResult<Vec<Region>> {
        let mut regions = self.regions.write();
        let current = regions
            .get(&region_id)
            .cloned()
            .ok_or(RegionError::RegionNotFound(region_id))?;
        if current.region_epoch != expected_epoch {
            return Err(RegionError::EpochNotMatch {
                region_id,
                req_conf_ver: expected_epoch.conf_ver,
                req_version: expected_epoch.version,
                conf_ver: current.region_epoch.conf_ver,
                version: current.region_epoch.version,
            }
            .into());
        }
        if split_keys.is_empty() || split_keys.len() != split_ids.len() {
            return Err(KvError::Internal(format!(
                "split of region {} has {} keys and {} ids",
                region_id,
                split_keys.len(),
                split_ids.len()
            )));
        }
        let mut prev = current.start_key.as_slice();
        for k in split_keys {
            current.check_key_in_region(k)?;
            if k.as_slice() <= prev {
                return Err(KvError::Internal(format!(
                    "split keys of region {} are not strictly increasing",
                    region_id
                )));
            }
            prev = k.as_slice();
        }

        let epoch = RegionEpoch::new(
            current.region_epoch.conf_ver,
            current.region_epoch.version + split_keys.len() as u64,
        );
        let mut out = Vec::with_capacity(split_keys.len() + 1);
        out.push(Region {
            end_key: split_keys[0].clone(),
            region_epoch: epoch,
            ..current.clone()
        });
        for (i, id) in split_ids.iter().enumerate() {
            if id.new_peer_ids.len() != current.peers.len() {
                return Err(KvError::Internal(format!(
                    "split id for region {} carries {} peers, region has {}",
                    id.new_region_id,
                    id.new_peer_ids.len(),
                    current.peers.len()
                )));
            }
            let end_key = split_keys.get(i + 1).cloned().unwrap_or_else(|| current.end_key.clone());
            let peers = current
                .peers
                .iter()
                .zip(&id.new_peer_ids)
                .map(|(p, &new_id)| Peer {
                    id: new_id,
                    store_id: p.store_id,
                })
                .collect();
            out.push(Region {
                id: id.new_region_id,
                start_key: split_keys[i].clone(),
                end_key,
                region_epoch: epoch,
                peers,
            });
        }

        let mut wb = WriteBatch::new();
        for r in &out {
            wb.put_cf(META_CF, keys::region_meta_key(r.id), encode(r)?);
        }
        self.engine.write(&wb)?;
        for r in &out {
            regions.insert(r.id, r.clone());
        }
        tracing::info!(
            region_id,
            new_regions = ?out.iter().map(|r| r.id).collect::<Vec<_>>(),
            version = epoch.version,
            "region split applied"
        );
        Ok(out)
    }

    /// Forget a region and its persisted metadata.
    pub fn remove(&self, region_id: RegionId) -> KvResult<Option<Region>> {
        let mut regions = self.regions.write();
        if !regions.contains_key(&region_id) {
            return Ok(None);
        }
        let mut wb = WriteBatch::new();
        wb.delete_cf(META_CF, keys::region_meta_key(region_id));
        self.engine.write(&wb)?;
        tracing::info!(region_id, "region removed");
        Ok(regions.remove(&region_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_storage::engine::EngineOptions;

    fn first_region() -> Region {
        Region {
            id: 2,
            start_key: vec![],
            end_key: vec![],
            region_epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer { id: 3, store_id: 1 }],
        }
    }

    fn split_id(region: u64, peer: u64) -> SplitId {
        SplitId {
            new_region_id: region,
            new_peer_ids: vec![peer],
        }
    }

    fn manager() -> (Arc<Engine>, RegionManager) {
        let engine = Arc::new(Engine::new_in_memory(EngineOptions::default()));
        let mgr = RegionManager::load(engine.clone()).unwrap();
        mgr.bootstrap(first_region()).unwrap();
        (engine, mgr)
    }

    #[test]
    fn test_split_produces_contiguous_ranges() {
        let (engine, mgr) = manager();
        let regions = mgr
            .apply_split(
                2,
                RegionEpoch::new(1, 1),
                &[b"g".to_vec(), b"p".to_vec()],
                &[split_id(10, 11), split_id(12, 13)],
            )
            .unwrap();
        let ranges: Vec<_> = regions
            .iter()
            .map(|r| (r.id, r.start_key.clone(), r.end_key.clone()))
            .collect();
        assert_eq!(
            ranges,
            vec![
                (2, vec![], b"g".to_vec()),
                (10, b"g".to_vec(), b"p".to_vec()),
                (12, b"p".to_vec(), vec![]),
            ]
        );
        assert!(regions.iter().all(|r| r.region_epoch == RegionEpoch::new(1, 3)));
        assert_eq!(regions[1].peers, vec![Peer { id: 11, store_id: 1 }]);
        assert_eq!(mgr.find_by_key(b"h").unwrap().id, 10);

        // Persisted: a fresh load sees the same map.
        let reloaded = RegionManager::load(engine).unwrap();
        assert_eq!(reloaded.regions(), mgr.regions());
    }

    #[test]
    fn test_split_with_stale_epoch_rejected() {
        let (_, mgr) = manager();
        let err = mgr
            .apply_split(2, RegionEpoch::new(1, 0), &[b"g".to_vec()], &[split_id(10, 11)])
            .unwrap_err();
        assert!(matches!(err, KvError::Region(RegionError::EpochNotMatch { .. })));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_split_key_validation() {
        let (_, mgr) = manager();
        mgr.apply_split(2, RegionEpoch::new(1, 1), &[b"m".to_vec()], &[split_id(10, 11)])
            .unwrap();
        // "z" is outside [.., m) of region 2 now.
        let err = mgr
            .apply_split(2, RegionEpoch::new(1, 2), &[b"z".to_vec()], &[split_id(20, 21)])
            .unwrap_err();
        assert!(matches!(err, KvError::Region(RegionError::KeyNotInRegion { .. })));
        let err = mgr
            .apply_split(
                10,
                RegionEpoch::new(1, 2),
                &[b"q".to_vec(), b"n".to_vec()],
                &[split_id(20, 21), split_id(22, 23)],
            )
            .unwrap_err();
        assert!(matches!(err, KvError::Internal(_)));
    }

    #[test]
    fn test_remove_and_store_meta() {
        let (engine, mgr) = manager();
        assert!(mgr.remove(2).unwrap().is_some());
        assert!(mgr.remove(2).unwrap().is_none());
        assert!(RegionManager::load(engine.clone()).unwrap().is_empty());

        assert_eq!(load_store(&engine).unwrap(), None);
        let store = Store {
            id: 1,
            address: "127.0.0.1:20160".into(),
        };
        save_store(&engine, &store).unwrap();
        assert_eq!(load_store(&engine).unwrap(), Some(store));
    }
}
