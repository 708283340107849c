//! Full node: request gate, region control loop, workers and the local
//! cluster manager running together.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ferrokv_common::config::NodeConfig;
use ferrokv_common::error::RegionError;
use ferrokv_common::keys;
use ferrokv_raftstore::snap::JobState;
use ferrokv_raftstore::{LocalPdClient, PdClient};
use ferrokv_server::kvproto::{
    CommitRequest, CommitResponse, Context, GetRequest, PrewriteRequest, ScanLockRequest,
    SplitRegionRequest,
};
use ferrokv_server::Node;
use ferrokv_storage::engine::Cf;
use ferrokv_storage::mvcc::Mutation;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.storage.wal_enabled = false;
    cfg.raftstore.worker_tick_interval_ms = 10;
    cfg.server.split_region_timeout_ms = 5_000;
    cfg
}

fn start(cfg: NodeConfig) -> (Node, Arc<LocalPdClient>) {
    let pd = Arc::new(LocalPdClient::new(1));
    let node = Node::start(cfg, pd.clone()).unwrap();
    (node, pd)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn write(node: &Node, ctx: &Context, key: &[u8], value: &[u8], start: u64, commit: u64) {
    let resp = node.server().prewrite(PrewriteRequest {
        context: ctx.clone(),
        mutations: vec![Mutation::put(key.to_vec(), value.to_vec())],
        primary_lock: key.to_vec(),
        start_version: start,
        lock_ttl: 3000,
    });
    assert!(resp.is_ok(), "{:?}", resp);
    let resp = node.server().commit(CommitRequest {
        context: ctx.clone(),
        keys: vec![key.to_vec()],
        start_version: start,
        commit_version: commit,
    });
    assert_eq!(resp, CommitResponse::default());
}

fn get(node: &Node, ctx: &Context, key: &[u8], version: u64) -> Option<Vec<u8>> {
    let resp = node.server().get(GetRequest {
        context: ctx.clone(),
        key: key.to_vec(),
        version,
    });
    assert!(resp.region_error.is_none(), "{:?}", resp);
    assert!(resp.error.is_none(), "{:?}", resp);
    resp.value
}

// ═══════════════════════════════════════════════════════════════════════════
// Bootstrap and request gate
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_fresh_node_bootstraps_first_region() {
    let (node, pd) = start(test_config());
    let regions = node.regions().regions();
    assert_eq!(regions.len(), 1);
    let region = &regions[0];
    assert!(region.start_key.is_empty() && region.end_key.is_empty());
    assert_eq!(region.find_peer(node.store_id()).map(|p| p.store_id), Some(node.store_id()));
    assert!(node.router().is_registered(region.id));
    assert_eq!(pd.region_count(), 1);
}

#[test]
fn test_oversized_request_rejected() {
    let (node, _pd) = start(test_config());
    let region = node.regions().regions()[0].clone();
    let ctx = Context::for_region(&region);
    let resp = node.server().prewrite(PrewriteRequest {
        context: ctx.clone(),
        mutations: vec![Mutation::put(b"big".to_vec(), vec![0u8; 6 * 1024 * 1024])],
        primary_lock: b"big".to_vec(),
        start_version: 5,
        lock_ttl: 3000,
    });
    assert!(matches!(
        resp.region_error,
        Some(RegionError::RaftEntryTooLarge { .. })
    ));
    let locks = node.server().scan_lock(ScanLockRequest {
        context: ctx,
        max_version: 100,
        ..Default::default()
    });
    assert!(locks.locks.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Split
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_split_region_reroutes_requests() {
    let (node, pd) = start(test_config());
    let region = node.regions().regions()[0].clone();
    let ctx = Context::for_region(&region);
    write(&node, &ctx, b"apple", b"1", 10, 11);
    write(&node, &ctx, b"zebra", b"2", 12, 13);

    let resp = node.server().split_region(SplitRegionRequest {
        context: ctx.clone(),
        split_keys: vec![b"m".to_vec()],
    });
    assert!(resp.region_error.is_none() && resp.other_error.is_none(), "{:?}", resp);
    assert_eq!(resp.regions.len(), 2);
    let (left, right) = (resp.regions[0].clone(), resp.regions[1].clone());
    assert_eq!(left.id, region.id);
    assert_eq!(left.end_key, b"m".to_vec());
    assert_eq!(right.start_key, b"m".to_vec());
    assert!(right.end_key.is_empty());
    assert_eq!(right.region_epoch.version, region.region_epoch.version + 1);
    assert!(node.router().is_registered(right.id));
    assert_eq!(node.regions().len(), 2);
    assert!(wait_until(|| pd.region_count() == 2));

    // The pre-split epoch is stale now.
    let resp = node.server().get(GetRequest {
        context: ctx.clone(),
        key: b"apple".to_vec(),
        version: 20,
    });
    assert!(matches!(resp.region_error, Some(RegionError::EpochNotMatch { .. })));

    let left_ctx = Context::for_region(&left);
    let right_ctx = Context::for_region(&right);
    assert_eq!(get(&node, &left_ctx, b"apple", 20), Some(b"1".to_vec()));
    assert_eq!(get(&node, &right_ctx, b"zebra", 20), Some(b"2".to_vec()));
    let resp = node.server().get(GetRequest {
        context: left_ctx,
        key: b"zebra".to_vec(),
        version: 20,
    });
    assert!(matches!(resp.region_error, Some(RegionError::KeyNotInRegion { .. })));
}

#[test]
fn test_split_with_stale_epoch_rejected() {
    let (node, _pd) = start(test_config());
    let region = node.regions().regions()[0].clone();
    let ctx = Context::for_region(&region);
    let resp = node.server().split_region(SplitRegionRequest {
        context: ctx.clone(),
        split_keys: vec![b"m".to_vec()],
    });
    assert_eq!(resp.regions.len(), 2);

    let resp = node.server().split_region(SplitRegionRequest {
        context: ctx,
        split_keys: vec![b"c".to_vec()],
    });
    assert!(matches!(resp.region_error, Some(RegionError::EpochNotMatch { .. })));
    assert!(resp.regions.is_empty());
    assert_eq!(node.regions().len(), 2);
}

#[test]
fn test_batch_split_creates_regions_in_order() {
    let (node, _pd) = start(test_config());
    let region = node.regions().regions()[0].clone();
    let resp = node.server().split_region(SplitRegionRequest {
        context: Context::for_region(&region),
        split_keys: vec![b"d".to_vec(), b"k".to_vec(), b"t".to_vec()],
    });
    assert_eq!(resp.regions.len(), 4, "{:?}", resp);
    let bounds: Vec<_> = resp
        .regions
        .iter()
        .map(|r| (r.start_key.clone(), r.end_key.clone()))
        .collect();
    assert_eq!(
        bounds,
        vec![
            (vec![], b"d".to_vec()),
            (b"d".to_vec(), b"k".to_vec()),
            (b"k".to_vec(), b"t".to_vec()),
            (b"t".to_vec(), vec![]),
        ]
    );
    assert_eq!(node.regions().find_by_key(b"m").map(|r| r.id), Some(resp.regions[2].id));
}

// ═══════════════════════════════════════════════════════════════════════════
// Restart
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_restart_reloads_store_and_regions() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config();
    cfg.storage.wal_enabled = true;
    cfg.storage.data_dir = dir.path().to_string_lossy().into_owned();

    let (store_id, left, right) = {
        let (node, _pd) = start(cfg.clone());
        let region = node.regions().regions()[0].clone();
        let ctx = Context::for_region(&region);
        write(&node, &ctx, b"apple", b"1", 10, 11);
        let resp = node.server().split_region(SplitRegionRequest {
            context: ctx,
            split_keys: vec![b"m".to_vec()],
        });
        assert_eq!(resp.regions.len(), 2);
        (node.store_id(), resp.regions[0].clone(), resp.regions[1].clone())
    };

    // A fresh cluster manager learns the regions back from the store.
    let (node, pd) = start(cfg);
    assert_eq!(node.store_id(), store_id);
    assert_eq!(node.regions().get(left.id), Some(left.clone()));
    assert_eq!(node.regions().get(right.id), Some(right.clone()));
    assert!(pd.is_cluster_bootstrapped().unwrap());
    assert_eq!(get(&node, &Context::for_region(&left), b"apple", 20), Some(b"1".to_vec()));

    let resp = node.server().split_region(SplitRegionRequest {
        context: Context::for_region(&right),
        split_keys: vec![b"t".to_vec()],
    });
    assert_eq!(resp.regions.len(), 2, "{:?}", resp);
    assert!(resp.regions[1].id > right.id.max(left.id));
}

// ═══════════════════════════════════════════════════════════════════════════
// Background workers
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_snapshot_moves_region_between_nodes() {
    let (src, _pd1) = start(test_config());
    let (dst, _pd2) = start(test_config());
    let region = src.regions().regions()[0].clone();
    let ctx = Context::for_region(&region);
    write(&src, &ctx, b"short", b"v", 10, 11);
    write(&src, &ctx, b"long", &[7u8; 1024], 12, 13);

    let snap = src.generate_snapshot(region.id, WAIT).unwrap();
    assert!(snap.verify());
    let status = dst.apply_snapshot(snap).unwrap();
    assert!(wait_until(|| status.state() == JobState::Finished));

    let dst_region = dst.regions().regions()[0].clone();
    let dst_ctx = Context::for_region(&dst_region);
    assert_eq!(get(&dst, &dst_ctx, b"short", 20), Some(b"v".to_vec()));
    assert_eq!(get(&dst, &dst_ctx, b"long", 20), Some(vec![7u8; 1024]));

    // Both nodes bootstrapped the same ids, so equal data hashes equal.
    assert_eq!(dst_region, region);
    let i = src.compute_hash(region.id).unwrap();
    let j = dst.compute_hash(dst_region.id).unwrap();
    assert!(wait_until(|| src.consistency_hash(region.id).is_some_and(|(idx, _)| idx == i)));
    assert!(wait_until(|| dst.consistency_hash(region.id).is_some_and(|(idx, _)| idx == j)));
    let (_, a) = src.consistency_hash(region.id).unwrap();
    let (_, b) = dst.consistency_hash(region.id).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_raft_log_gc_through_node() {
    let (node, _pd) = start(test_config());
    let region_id = node.regions().regions()[0].id;
    for idx in 1..=10u64 {
        node.raft_engine()
            .put_cf(Cf::Raft, &keys::raft_log_key(region_id, idx), b"entry")
            .unwrap();
    }
    node.gc_raft_log(region_id, 0, 6).unwrap();
    let prefix = keys::raft_log_prefix(region_id);
    assert!(wait_until(|| {
        node.raft_engine()
            .snapshot()
            .range_cf(Cf::Raft, &prefix, None)
            .count()
            == 5
    }));
    assert!(node.raft_engine().get_cf(Cf::Raft, &keys::raft_log_key(region_id, 6)).is_some());
    assert!(node.raft_engine().get_cf(Cf::Raft, &keys::raft_log_key(region_id, 5)).is_none());
}

#[test]
fn test_heartbeats_reach_cluster_manager() {
    let mut cfg = test_config();
    cfg.raftstore.pd_heartbeat_tick_interval_ms = 30;
    cfg.raftstore.pd_store_heartbeat_tick_interval_ms = 30;
    let (node, pd) = start(cfg);
    let region = node.regions().regions()[0].clone();
    let ctx = Context::for_region(&region);
    write(&node, &ctx, b"a", b"1", 10, 11);
    write(&node, &ctx, b"b", b"2", 12, 13);

    assert!(wait_until(|| pd
        .last_heartbeat(region.id)
        .is_some_and(|hb| hb.approximate_keys >= 2 && hb.approximate_size > 0)));
    assert!(wait_until(|| pd
        .last_store_stats(node.store_id())
        .is_some_and(|s| s.region_count == 1 && s.used_size > 0)));
}

#[test]
fn test_shutdown_is_idempotent() {
    let (mut node, _pd) = start(test_config());
    node.shutdown();
    node.shutdown();
    assert!(node.schedulers().region.is_stopped());
}
