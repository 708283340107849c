//! Request front end of a node.
//!
//! Every request passes the same gate before touching the MVCC store: the
//! payload must stay below `max_request_size`, the addressed region must be
//! served here at the request's epoch, and every key must fall inside it.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use ferrokv_common::error::RegionError;
use ferrokv_common::{KvError, Region, RegionId};
use ferrokv_observability as obs;
use ferrokv_raftstore::pd_client::FlowStats;
use ferrokv_raftstore::{Msg, Router};
use ferrokv_storage::mvcc::{MvccStore, Pair};
use parking_lot::Mutex;
use tracing::Span;

use crate::kvproto::*;
use crate::region_manager::RegionManager;

pub struct KvServer {
    store: Arc<MvccStore>,
    regions: Arc<RegionManager>,
    router: Router,
    max_request_size: u64,
    split_timeout: Duration,
    reads: Mutex<HashMap<RegionId, FlowStats>>,
    span: Span,
}

impl KvServer {
    pub fn new(
        store: Arc<MvccStore>,
        regions: Arc<RegionManager>,
        router: Router,
        max_request_size: u64,
        split_timeout: Duration,
    ) -> Self {
        Self {
            store,
            regions,
            router,
            max_request_size,
            split_timeout,
            reads: Mutex::new(HashMap::new()),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Size, region and key-range gate shared by every request.
    fn check_request<'a>(
        &self,
        ctx: &Context,
        payload_size: u64,
        keys: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Region, RegionError> {
        if payload_size >= self.max_request_size {
            obs::record_request_rejected("too_large");
            tracing::warn!(
                region_id = ctx.region_id,
                payload_size,
                limit = self.max_request_size,
                "request rejected: payload too large"
            );
            return Err(RegionError::RaftEntryTooLarge {
                region_id: ctx.region_id,
                entry_size: payload_size,
            });
        }
        let region = self.regions.get(ctx.region_id).ok_or_else(|| {
            obs::record_request_rejected("region_not_found");
            RegionError::RegionNotFound(ctx.region_id)
        })?;
        if region.region_epoch != ctx.region_epoch {
            obs::record_request_rejected("epoch_not_match");
            return Err(RegionError::EpochNotMatch {
                region_id: region.id,
                req_conf_ver: ctx.region_epoch.conf_ver,
                req_version: ctx.region_epoch.version,
                conf_ver: region.region_epoch.conf_ver,
                version: region.region_epoch.version,
            });
        }
        for key in keys {
            if let Err(e) = region.check_key_in_region(key) {
                obs::record_request_rejected("key_not_in_region");
                tracing::warn!(region_id = region.id, error = %e, "key outside region");
                return Err(e);
            }
        }
        Ok(region)
    }

    fn record_reads(&self, region_id: RegionId, pairs: impl IntoIterator<Item = u64>) {
        let mut reads = self.reads.lock();
        let flow = reads.entry(region_id).or_default();
        for bytes in pairs {
            flow.read_keys += 1;
            flow.read_bytes += bytes;
        }
    }

    /// Drain the read flow gathered since the last call.
    pub fn take_read_stats(&self) -> HashMap<RegionId, FlowStats> {
        std::mem::take(&mut *self.reads.lock())
    }

    /// Clip `[start, end)` to the region; an empty `end` means its end.
    fn clip_end(region: &Region, end: &[u8]) -> Vec<u8> {
        if end.is_empty() || (!region.end_key.is_empty() && end > region.end_key.as_slice()) {
            region.end_key.clone()
        } else {
            end.to_vec()
        }
    }

    pub fn get(&self, req: GetRequest) -> GetResponse {
        let _enter = self.span.enter();
        let region = match self.check_request(&req.context, req.payload_size(), [req.key.as_slice()]) {
            Ok(r) => r,
            Err(e) => {
                return GetResponse {
                    region_error: Some(e),
                    ..Default::default()
                }
            }
        };
        match self.store.get(&req.key, req.version) {
            Ok(value) => {
                if let Some(v) = &value {
                    self.record_reads(region.id, [(req.key.len() + v.len()) as u64]);
                }
                GetResponse {
                    value,
                    ..Default::default()
                }
            }
            Err(e) => GetResponse {
                error: Some(e.into()),
                ..Default::default()
            },
        }
    }

    pub fn scan(&self, req: ScanRequest) -> ScanResponse {
        let _enter = self.span.enter();
        let region = match self.check_request(
            &req.context,
            req.payload_size(),
            [req.start_key.as_slice()],
        ) {
            Ok(r) => r,
            Err(e) => {
                return ScanResponse {
                    region_error: Some(e),
                    ..Default::default()
                }
            }
        };
        let end = Self::clip_end(&region, &req.end_key);
        let pairs = self
            .store
            .scan(&req.start_key, &end, req.limit as usize, req.version);
        self.record_reads(region.id, pairs.iter().map(pair_size));
        ScanResponse {
            region_error: None,
            pairs: pairs.into_iter().map(KvPair::from).collect(),
        }
    }

    pub fn batch_get(&self, req: BatchGetRequest) -> BatchGetResponse {
        let _enter = self.span.enter();
        let region = match self.check_request(
            &req.context,
            req.payload_size(),
            req.keys.iter().map(|k| k.as_slice()),
        ) {
            Ok(r) => r,
            Err(e) => {
                return BatchGetResponse {
                    region_error: Some(e),
                    ..Default::default()
                }
            }
        };
        let pairs = self.store.batch_get(&req.keys, req.version);
        self.record_reads(region.id, pairs.iter().map(pair_size));
        BatchGetResponse {
            region_error: None,
            pairs: pairs.into_iter().map(KvPair::from).collect(),
        }
    }

    pub fn prewrite(&self, req: PrewriteRequest) -> PrewriteResponse {
        let _enter = self.span.enter();
        if let Err(e) = self.check_request(
            &req.context,
            req.payload_size(),
            req.mutations.iter().map(|m| m.key.as_slice()),
        ) {
            return PrewriteResponse {
                region_error: Some(e),
                errors: Vec::new(),
            };
        }
        let results = self.store.prewrite(
            &req.mutations,
            &req.primary_lock,
            req.start_version,
            req.lock_ttl,
        );
        PrewriteResponse {
            region_error: None,
            errors: results.into_iter().map(|r| r.err().map(KeyError::from)).collect(),
        }
    }

    pub fn commit(&self, req: CommitRequest) -> CommitResponse {
        let _enter = self.span.enter();
        if let Err(e) = self.check_request(
            &req.context,
            req.payload_size(),
            req.keys.iter().map(|k| k.as_slice()),
        ) {
            return CommitResponse {
                region_error: Some(e),
                error: None,
            };
        }
        CommitResponse {
            region_error: None,
            error: self
                .store
                .commit(&req.keys, req.start_version, req.commit_version)
                .err()
                .map(KeyError::from),
        }
    }

    pub fn batch_rollback(&self, req: BatchRollbackRequest) -> BatchRollbackResponse {
        let _enter = self.span.enter();
        if let Err(e) = self.check_request(
            &req.context,
            req.payload_size(),
            req.keys.iter().map(|k| k.as_slice()),
        ) {
            return BatchRollbackResponse {
                region_error: Some(e),
                error: None,
            };
        }
        BatchRollbackResponse {
            region_error: None,
            error: self
                .store
                .rollback(&req.keys, req.start_version)
                .err()
                .map(KeyError::from),
        }
    }

    pub fn scan_lock(&self, req: ScanLockRequest) -> ScanLockResponse {
        let _enter = self.span.enter();
        let region = match self.check_request(
            &req.context,
            req.payload_size(),
            [req.start_key.as_slice()],
        ) {
            Ok(r) => r,
            Err(e) => {
                return ScanLockResponse {
                    region_error: Some(e),
                    ..Default::default()
                }
            }
        };
        let end = Self::clip_end(&region, &req.end_key);
        match self
            .store
            .scan_locks(&req.start_key, &end, req.max_version, req.limit as usize)
        {
            Ok(locks) => ScanLockResponse {
                locks,
                ..Default::default()
            },
            Err(e) => ScanLockResponse {
                error: Some(e.into()),
                ..Default::default()
            },
        }
    }

    /// Ask the region's control loop to split and wait for the result.
    pub fn split_region(&self, req: SplitRegionRequest) -> SplitRegionResponse {
        let _enter = self.span.enter();
        let region = match self.check_request(
            &req.context,
            req.payload_size(),
            req.split_keys.iter().map(|k| k.as_slice()),
        ) {
            Ok(r) => r,
            Err(e) => {
                return SplitRegionResponse {
                    region_error: Some(e),
                    ..Default::default()
                }
            }
        };
        let (tx, rx) = mpsc::sync_channel(1);
        let msg = Msg::SplitRegion {
            region_epoch: region.region_epoch,
            split_keys: req.split_keys,
            callback: Some(Box::new(move |res| {
                let _ = tx.send(res);
            })),
        };
        if let Err(e) = self.router.send(region.id, msg) {
            return SplitRegionResponse {
                other_error: Some(e.to_string()),
                ..Default::default()
            };
        }
        match rx.recv_timeout(self.split_timeout) {
            Ok(Ok(regions)) => SplitRegionResponse {
                regions,
                ..Default::default()
            },
            Ok(Err(KvError::Region(e))) => SplitRegionResponse {
                region_error: Some(e),
                ..Default::default()
            },
            Ok(Err(e)) => SplitRegionResponse {
                other_error: Some(e.to_string()),
                ..Default::default()
            },
            Err(_) => {
                tracing::warn!(region_id = region.id, "split region timed out");
                SplitRegionResponse {
                    other_error: Some(format!("split of region {} timed out", region.id)),
                    ..Default::default()
                }
            }
        }
    }
}

fn pair_size(p: &Pair) -> u64 {
    let value = p.result.as_ref().map_or(0, |v| v.len());
    (p.key.len() + value) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrokv_common::{Peer, RegionEpoch};
    use ferrokv_storage::engine::{Engine, EngineOptions};
    use ferrokv_storage::mvcc::Mutation;

    const LIMIT: u64 = 6 * 1024 * 1024;

    fn server() -> (KvServer, Region) {
        let engine = Arc::new(Engine::new_in_memory(EngineOptions::default()));
        let regions = Arc::new(RegionManager::load(engine.clone()).unwrap());
        let region = Region {
            id: 2,
            start_key: b"a".to_vec(),
            end_key: b"m".to_vec(),
            region_epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer { id: 3, store_id: 1 }],
        };
        regions.bootstrap(region.clone()).unwrap();
        let store = Arc::new(MvccStore::new(engine, 64));
        let server = KvServer::new(store, regions, Router::new(), LIMIT, Duration::from_millis(200));
        (server, region)
    }

    fn write(server: &KvServer, ctx: &Context, key: &[u8], value: &[u8], start: u64, commit: u64) {
        let resp = server.prewrite(PrewriteRequest {
            context: ctx.clone(),
            mutations: vec![Mutation::put(key.to_vec(), value.to_vec())],
            primary_lock: key.to_vec(),
            start_version: start,
            lock_ttl: 3000,
        });
        assert!(resp.is_ok(), "{:?}", resp);
        let resp = server.commit(CommitRequest {
            context: ctx.clone(),
            keys: vec![key.to_vec()],
            start_version: start,
            commit_version: commit,
        });
        assert_eq!(resp, CommitResponse::default());
    }

    #[test]
    fn test_round_trip_through_gate() {
        let (server, region) = server();
        let ctx = Context::for_region(&region);
        write(&server, &ctx, b"b", b"1", 10, 11);
        let resp = server.get(GetRequest {
            context: ctx.clone(),
            key: b"b".to_vec(),
            version: 20,
        });
        assert_eq!(resp.value, Some(b"1".to_vec()));
        let reads = server.take_read_stats();
        assert_eq!(reads[&2].read_keys, 1);
        assert!(server.take_read_stats().is_empty());
    }

    #[test]
    fn test_oversized_prewrite_rejected_before_mvcc() {
        let (server, region) = server();
        let resp = server.prewrite(PrewriteRequest {
            context: Context::for_region(&region),
            mutations: vec![Mutation::put(b"b".to_vec(), vec![0u8; LIMIT as usize])],
            primary_lock: b"b".to_vec(),
            start_version: 5,
            lock_ttl: 3000,
        });
        assert!(matches!(
            resp.region_error,
            Some(RegionError::RaftEntryTooLarge { region_id: 2, .. })
        ));
        assert!(resp.errors.is_empty());
        let locks = server.scan_lock(ScanLockRequest {
            context: Context::for_region(&region),
            start_key: b"a".to_vec(),
            max_version: u64::MAX,
            ..Default::default()
        });
        assert!(locks.locks.is_empty());
    }

    #[test]
    fn test_key_outside_region() {
        let (server, region) = server();
        let resp = server.get(GetRequest {
            context: Context::for_region(&region),
            key: b"x".to_vec(),
            version: 1,
        });
        assert!(matches!(
            resp.region_error,
            Some(RegionError::KeyNotInRegion { region_id: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_region_and_stale_epoch() {
        let (server, region) = server();
        let resp = server.get(GetRequest {
            context: Context {
                region_id: 99,
                region_epoch: region.region_epoch,
            },
            key: b"b".to_vec(),
            version: 1,
        });
        assert_eq!(resp.region_error, Some(RegionError::RegionNotFound(99)));

        let resp = server.batch_get(BatchGetRequest {
            context: Context {
                region_id: 2,
                region_epoch: RegionEpoch::new(1, 0),
            },
            keys: vec![b"b".to_vec()],
            version: 1,
        });
        assert!(matches!(
            resp.region_error,
            Some(RegionError::EpochNotMatch { .. })
        ));
    }

    #[test]
    fn test_scan_is_clipped_to_region() {
        let (server, region) = server();
        let ctx = Context::for_region(&region);
        write(&server, &ctx, b"b", b"1", 10, 11);
        write(&server, &ctx, b"c", b"2", 12, 13);
        let resp = server.scan(ScanRequest {
            context: ctx,
            start_key: b"a".to_vec(),
            end_key: b"zzz".to_vec(),
            limit: 0,
            version: 20,
        });
        let keys: Vec<_> = resp.pairs.iter().map(|p| p.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_locked_read_and_rollback() {
        let (server, region) = server();
        let ctx = Context::for_region(&region);
        let resp = server.prewrite(PrewriteRequest {
            context: ctx.clone(),
            mutations: vec![Mutation::put(b"d".to_vec(), b"v".to_vec())],
            primary_lock: b"d".to_vec(),
            start_version: 30,
            lock_ttl: 3000,
        });
        assert!(resp.is_ok());
        let get = server.get(GetRequest {
            context: ctx.clone(),
            key: b"d".to_vec(),
            version: 40,
        });
        assert!(matches!(get.error, Some(KeyError::Locked(_))));
        let rb = server.batch_rollback(BatchRollbackRequest {
            context: ctx.clone(),
            keys: vec![b"d".to_vec()],
            start_version: 30,
        });
        assert_eq!(rb.error, None);
        let get = server.get(GetRequest {
            context: ctx,
            key: b"d".to_vec(),
            version: 40,
        });
        assert_eq!(get, GetResponse::default());
    }

    #[test]
    fn test_split_without_control_loop_reports_error() {
        let (server, region) = server();
        let resp = server.split_region(SplitRegionRequest {
            context: Context::for_region(&region),
            split_keys: vec![b"g".to_vec()],
        });
        assert!(resp.other_error.is_some());
        assert!(resp.regions.is_empty());
    }
}
