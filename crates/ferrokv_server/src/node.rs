//! A storage node: engines, region map, background workers and the region
//! control loop that turns worker results into region changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ferrokv_common::config::{NodeConfig, StorageConfig};
use ferrokv_common::error::{ClusterError, RegionError};
use ferrokv_common::{KvError, KvResult, Peer, Region, RegionEpoch, RegionId, ShutdownBarrier, Store, StoreId};
use ferrokv_raftstore::msg::SplitRegionCallback;
use ferrokv_raftstore::pd_client::{RegionHeartbeat, StoreStats};
use ferrokv_raftstore::runner::{
    CompactRunner, ComputeHashRunner, PdRunner, RaftLogGcRunner, RegionRunner, SplitCheckRunner,
};
use ferrokv_raftstore::snap::{JobStatus, RegionSnapshot};
use ferrokv_raftstore::task::{
    CheckAndCompactTask, CompactTask, ComputeHashTask, KeyRange, RaftLogGcTask, SplitCheckTask,
};
use ferrokv_raftstore::{
    Msg, PdClient, PdTask, RegionMsg, RegionTask, Router, Runnable, ScheduleError, Scheduler,
    SplitId, Task, Worker,
};
use ferrokv_storage::engine::{Cf, Engine, EngineOptions};
use ferrokv_storage::mvcc::codec::data_range;
use ferrokv_storage::mvcc::MvccStore;
use parking_lot::Mutex;

use crate::region_manager::{self, RegionManager};
use crate::server::KvServer;

const CONTROL_TICK: Duration = Duration::from_millis(20);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer handles of the node's workers.
#[derive(Clone)]
pub struct Schedulers {
    pub split_check: Scheduler,
    pub region: Scheduler,
    pub compact: Scheduler,
    pub raft_log_gc: Scheduler,
    pub compute_hash: Scheduler,
    pub pd: Scheduler,
}

type HashResults = Arc<Mutex<HashMap<RegionId, (u64, u32)>>>;

pub struct Node {
    cfg: NodeConfig,
    store: Store,
    engine: Arc<Engine>,
    raft_engine: Arc<Engine>,
    regions: Arc<RegionManager>,
    router: Router,
    server: Arc<KvServer>,
    barrier: ShutdownBarrier,
    workers: Vec<Worker>,
    schedulers: Schedulers,
    hashes: HashResults,
    next_hash_index: AtomicU64,
    stop: Arc<AtomicBool>,
    control: Option<JoinHandle<()>>,
}

fn open_engines(cfg: &StorageConfig) -> KvResult<(Arc<Engine>, Arc<Engine>)> {
    let opts = EngineOptions::from(cfg);
    if !cfg.wal_enabled || cfg.data_dir.is_empty() {
        tracing::info!("WAL disabled, running in memory");
        return Ok((
            Arc::new(Engine::new_in_memory(opts.clone())),
            Arc::new(Engine::new_in_memory(opts)),
        ));
    }
    let dir = Path::new(&cfg.data_dir);
    let kv = Engine::open(&dir.join("kv"), opts.clone())?;
    let raft = Engine::open(&dir.join("raft"), opts)?;
    Ok((Arc::new(kv), Arc::new(raft)))
}

/// Load the store identity, or register a new store (and the first
/// region, when the cluster is fresh).
fn init_store(
    engine: &Engine,
    regions: &RegionManager,
    pd: &dyn PdClient,
    address: &str,
) -> KvResult<Store> {
    if let Some(store) = region_manager::load_store(engine)? {
        tracing::info!(store_id = store.id, "store meta loaded");
        if !pd.is_cluster_bootstrapped()? {
            reseed_cluster(pd, &store, regions)?;
        }
        return Ok(store);
    }
    let store = Store {
        id: pd.alloc_id()?,
        address: address.to_string(),
    };
    if !pd.is_cluster_bootstrapped()? {
        let region = Region {
            id: pd.alloc_id()?,
            start_key: Vec::new(),
            end_key: Vec::new(),
            region_epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer {
                id: pd.alloc_id()?,
                store_id: store.id,
            }],
        };
        match pd.bootstrap_cluster(&store, &region) {
            Ok(()) => regions.bootstrap(region)?,
            Err(ClusterError::AlreadyBootstrapped) => {
                tracing::info!(store_id = store.id, "cluster bootstrapped concurrently, joining");
            }
            Err(e) => return Err(e.into()),
        }
    }
    region_manager::save_store(engine, &store)?;
    tracing::info!(store_id = store.id, "store initialized");
    Ok(store)
}

/// A cluster manager that lost its state (the in-process one after a
/// restart) learns the cluster back from this store's regions.
fn reseed_cluster(pd: &dyn PdClient, store: &Store, regions: &RegionManager) -> KvResult<()> {
    let all = regions.regions();
    let Some(first) = all.first() else {
        tracing::warn!(store_id = store.id, "cluster manager not bootstrapped and no local regions");
        return Ok(());
    };
    match pd.bootstrap_cluster(store, first) {
        Ok(()) | Err(ClusterError::AlreadyBootstrapped) => {}
        Err(e) => return Err(e.into()),
    }
    pd.report_batch_split(&all)?;
    tracing::info!(store_id = store.id, regions = all.len(), "cluster manager reseeded");
    Ok(())
}

fn start_worker<R: Runnable>(worker: &mut Worker, runner: R) -> KvResult<()> {
    worker
        .start(runner)
        .map_err(|e| KvError::Internal(format!("failed to start worker {}: {}", worker.name(), e)))
}

impl Node {
    pub fn start(cfg: NodeConfig, pd: Arc<dyn PdClient>) -> KvResult<Node> {
        cfg.validate()?;
        let (engine, raft_engine) = open_engines(&cfg.storage)?;
        let regions = Arc::new(RegionManager::load(engine.clone())?);
        let store = init_store(&engine, &regions, pd.as_ref(), &cfg.server.addr)?;
        pd.put_store(&store)?;

        let router = Router::new();
        let barrier = ShutdownBarrier::new();
        let rs = &cfg.raftstore;
        let tick = Duration::from_millis(rs.worker_tick_interval_ms);
        let new_worker = |name: &str| {
            Worker::new(name, rs.worker_capacity, barrier.clone())
                .with_tick_interval(tick)
                .with_span(tracing::info_span!("worker", worker = name, store_id = store.id))
        };

        let mut split_check = new_worker("split-check");
        start_worker(
            &mut split_check,
            SplitCheckRunner::new(engine.clone(), router.clone(), cfg.split_check.clone()),
        )?;
        let mut region = new_worker("region");
        start_worker(&mut region, RegionRunner::new(engine.clone(), rs.snap_apply_batch_size))?;
        let mut compact = new_worker("compact");
        start_worker(&mut compact, CompactRunner::new(engine.clone()))?;
        let mut raft_log_gc = new_worker("raft-log-gc");
        start_worker(&mut raft_log_gc, RaftLogGcRunner::new())?;
        let mut compute_hash = new_worker("compute-hash");
        start_worker(&mut compute_hash, ComputeHashRunner::new(router.clone()))?;
        let mut pd_worker = new_worker("pd");
        start_worker(&mut pd_worker, PdRunner::new(store.id, pd.clone(), router.clone()))?;

        let schedulers = Schedulers {
            split_check: split_check.scheduler(),
            region: region.scheduler(),
            compact: compact.scheduler(),
            raft_log_gc: raft_log_gc.scheduler(),
            compute_hash: compute_hash.scheduler(),
            pd: pd_worker.scheduler(),
        };
        let workers = vec![split_check, region, compact, raft_log_gc, compute_hash, pd_worker];

        let mvcc = Arc::new(
            MvccStore::new(engine.clone(), cfg.mvcc.latch_slots)
                .with_span(tracing::info_span!("mvcc", store_id = store.id)),
        );
        let server = Arc::new(
            KvServer::new(
                mvcc,
                regions.clone(),
                router.clone(),
                cfg.server.max_request_size,
                Duration::from_millis(cfg.server.split_region_timeout_ms),
            )
            .with_span(tracing::info_span!("kv_server", store_id = store.id)),
        );

        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        for id in regions.region_ids() {
            router.register(id, mailbox_tx.clone());
        }
        let hashes: HashResults = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel();
        let control = ControlLoop {
            store_id: store.id,
            cfg: cfg.clone(),
            engine: engine.clone(),
            regions: regions.clone(),
            router: router.clone(),
            server: server.clone(),
            schedulers: schedulers.clone(),
            hashes: hashes.clone(),
            mailbox_tx,
            mailbox_rx,
            events_tx,
            events_rx,
            stop: stop.clone(),
            timers: Timers::new(&cfg, Instant::now()),
        };
        let span = tracing::info_span!("control", store_id = store.id);
        let control = std::thread::Builder::new()
            .name("ferrokv-control".into())
            .spawn(move || {
                let _enter = span.enter();
                control.run();
            })
            .map_err(|e| KvError::Internal(format!("failed to spawn control loop: {}", e)))?;

        tracing::info!(
            store_id = store.id,
            regions = regions.len(),
            durable = engine.is_durable(),
            "node started"
        );
        Ok(Node {
            cfg,
            store,
            engine,
            raft_engine,
            regions,
            router,
            server,
            barrier,
            workers,
            schedulers,
            hashes,
            next_hash_index: AtomicU64::new(1),
            stop,
            control: Some(control),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn raft_engine(&self) -> &Arc<Engine> {
        &self.raft_engine
    }

    pub fn regions(&self) -> &Arc<RegionManager> {
        &self.regions
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn server(&self) -> &Arc<KvServer> {
        &self.server
    }

    pub fn schedulers(&self) -> &Schedulers {
        &self.schedulers
    }

    fn region(&self, region_id: RegionId) -> KvResult<Region> {
        self.regions
            .get(region_id)
            .ok_or_else(|| RegionError::RegionNotFound(region_id).into())
    }

    /// Check one region for split keys regardless of its size.
    pub fn split_check(&self, region_id: RegionId) -> KvResult<()> {
        let task = Task::SplitCheck(SplitCheckTask {
            region: self.region(region_id)?,
            auto_split: false,
            policy: self.cfg.split_check.policy,
        });
        schedule(&self.schedulers.split_check, task)
    }

    /// Start a consistency hash of the region; returns the index it is
    /// taken at.
    pub fn compute_hash(&self, region_id: RegionId) -> KvResult<u64> {
        let index = self.next_hash_index.fetch_add(1, Ordering::SeqCst);
        let task = Task::ComputeHash(ComputeHashTask {
            index,
            region: self.region(region_id)?,
            snap: self.engine.snapshot(),
        });
        schedule(&self.schedulers.compute_hash, task)?;
        Ok(index)
    }

    /// Latest `(index, hash)` reported for the region.
    pub fn consistency_hash(&self, region_id: RegionId) -> Option<(u64, u32)> {
        self.hashes.lock().get(&region_id).copied()
    }

    pub fn generate_snapshot(&self, region_id: RegionId, timeout: Duration) -> KvResult<RegionSnapshot> {
        let region = self.region(region_id)?;
        let (tx, rx) = mpsc::sync_channel(1);
        schedule(
            &self.schedulers.region,
            Task::Region(RegionTask::Generate {
                region_id,
                start_key: region.start_key,
                end_key: region.end_key,
                status: JobStatus::new(),
                notifier: tx,
            }),
        )?;
        rx.recv_timeout(timeout).map_err(|_| {
            KvError::Cluster(ClusterError::Timeout(format!(
                "snapshot of region {} not generated",
                region_id
            )))
        })
    }

    /// Queue a snapshot for application; poll the returned status.
    pub fn apply_snapshot(&self, snapshot: RegionSnapshot) -> KvResult<JobStatus> {
        let status = JobStatus::new();
        schedule(
            &self.schedulers.region,
            Task::Region(RegionTask::Apply {
                region_id: snapshot.region_id,
                status: status.clone(),
                snapshot,
            }),
        )?;
        Ok(status)
    }

    pub fn gc_raft_log(&self, region_id: RegionId, start_idx: u64, end_idx: u64) -> KvResult<()> {
        schedule(
            &self.schedulers.raft_log_gc,
            Task::RaftLogGc(RaftLogGcTask {
                raft_engine: self.raft_engine.clone(),
                region_id,
                start_idx,
                end_idx,
            }),
        )
    }

    /// Manual compaction of `cf` over engine keys `[start, end)`.
    pub fn compact(&self, cf: Cf, start_key: Option<Vec<u8>>, end_key: Option<Vec<u8>>) -> KvResult<()> {
        schedule(
            &self.schedulers.compact,
            Task::Compact(CompactTask {
                cf,
                start_key,
                end_key,
            }),
        )
    }

    /// Stop the control loop, then every worker, and wait for them.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(h) = self.control.take() {
            if h.join().is_err() {
                tracing::error!("control loop panicked");
            }
        }
        for w in &self.workers {
            if let Err(e) = w.stop() {
                tracing::debug!(error = %e, "worker already stopped");
            }
        }
        if !self.barrier.wait_timeout(SHUTDOWN_TIMEOUT) {
            tracing::warn!(pending = self.barrier.pending(), "workers did not stop in time");
        }
        for w in &mut self.workers {
            w.join();
        }
        tracing::info!(store_id = self.store.id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn schedule(scheduler: &Scheduler, task: Task) -> KvResult<()> {
    scheduler.schedule(task).map_err(|e| match e {
        ScheduleError::Full { worker, .. } | ScheduleError::Stopped { worker, .. } => {
            KvError::Internal(format!("worker {} unavailable", worker))
        }
    })
}

/// Periodic tasks are dropped rather than stalling the control loop.
fn schedule_periodic(scheduler: &Scheduler, task: Task) {
    if let Err(e) = scheduler.try_schedule(task) {
        tracing::debug!(error = %e, "periodic task dropped");
    }
}

enum ControlEvent {
    SplitIds {
        region_id: RegionId,
        region_epoch: RegionEpoch,
        split_keys: Vec<Vec<u8>>,
        result: Result<Vec<SplitId>, ClusterError>,
        callback: Option<SplitRegionCallback>,
    },
}

struct Timers {
    split_check: (Duration, Instant),
    pd_heartbeat: (Duration, Instant),
    store_heartbeat: (Duration, Instant),
    compact_check: (Duration, Instant),
}

impl Timers {
    fn new(cfg: &NodeConfig, now: Instant) -> Self {
        let t = |ms: u64| {
            let d = Duration::from_millis(ms.max(1));
            (d, now + d)
        };
        let rs = &cfg.raftstore;
        Self {
            split_check: t(rs.split_check_tick_interval_ms),
            pd_heartbeat: t(rs.pd_heartbeat_tick_interval_ms),
            store_heartbeat: t(rs.pd_store_heartbeat_tick_interval_ms),
            compact_check: t(rs.compact_check_tick_interval_ms),
        }
    }
}

fn due(timer: &mut (Duration, Instant), now: Instant) -> bool {
    if now < timer.1 {
        return false;
    }
    timer.1 = now + timer.0;
    true
}

struct ControlLoop {
    store_id: StoreId,
    cfg: NodeConfig,
    engine: Arc<Engine>,
    regions: Arc<RegionManager>,
    router: Router,
    server: Arc<KvServer>,
    schedulers: Schedulers,
    hashes: HashResults,
    mailbox_tx: Sender<RegionMsg>,
    mailbox_rx: Receiver<RegionMsg>,
    events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,
    stop: Arc<AtomicBool>,
    timers: Timers,
}

impl ControlLoop {
    fn run(mut self) {
        tracing::info!("region control loop started");
        while !self.stop.load(Ordering::SeqCst) {
            while let Ok(ev) = self.events_rx.try_recv() {
                self.handle_event(ev);
            }
            match self.mailbox_rx.recv_timeout(CONTROL_TICK) {
                Ok(msg) => self.handle_msg(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.on_tick(Instant::now());
        }
        tracing::info!("region control loop stopped");
    }

    fn handle_msg(&mut self, RegionMsg { region_id, msg }: RegionMsg) {
        match msg {
            Msg::SplitRegion {
                region_epoch,
                split_keys,
                callback,
            } => self.on_split_region(region_id, region_epoch, split_keys, callback),
            Msg::ComputeHashResult { index, hash } => {
                tracing::debug!(region_id, index, hash, "consistency hash recorded");
                self.hashes.lock().insert(region_id, (index, hash));
            }
            Msg::StalePeer { peer } => {
                if peer.store_id == self.store_id {
                    self.destroy_region(region_id);
                }
            }
        }
    }

    fn on_split_region(
        &mut self,
        region_id: RegionId,
        region_epoch: RegionEpoch,
        split_keys: Vec<Vec<u8>>,
        callback: Option<SplitRegionCallback>,
    ) {
        let reply = |callback: Option<SplitRegionCallback>, res: KvResult<Vec<Region>>| {
            if let Some(cb) = callback {
                cb(res);
            }
        };
        let Some(region) = self.regions.get(region_id) else {
            reply(callback, Err(RegionError::RegionNotFound(region_id).into()));
            return;
        };
        if region.region_epoch != region_epoch {
            tracing::info!(
                region_id,
                req_epoch = ?region_epoch,
                epoch = ?region.region_epoch,
                "stale split request ignored"
            );
            reply(
                callback,
                Err(RegionError::EpochNotMatch {
                    region_id,
                    req_conf_ver: region_epoch.conf_ver,
                    req_version: region_epoch.version,
                    conf_ver: region.region_epoch.conf_ver,
                    version: region.region_epoch.version,
                }
                .into()),
            );
            return;
        }
        let peer = region.find_peer(self.store_id).copied().unwrap_or_default();
        let events = self.events_tx.clone();
        let keys = split_keys.clone();
        let task = Task::Pd(PdTask::AskBatchSplit {
            region,
            split_keys,
            peer,
            right_derive: false,
            callback: Box::new(move |result| {
                let _ = events.send(ControlEvent::SplitIds {
                    region_id,
                    region_epoch,
                    split_keys: keys,
                    result,
                    callback,
                });
            }),
        });
        if let Err(e) = self.schedulers.pd.try_schedule(task) {
            tracing::warn!(region_id, error = %e, "split request dropped");
        }
    }

    fn handle_event(&mut self, ev: ControlEvent) {
        let ControlEvent::SplitIds {
            region_id,
            region_epoch,
            split_keys,
            result,
            callback,
        } = ev;
        let res = result.map_err(KvError::from).and_then(|ids| {
            self.regions
                .apply_split(region_id, region_epoch, &split_keys, &ids)
        });
        match &res {
            Ok(regions) => {
                for r in regions.iter().skip(1) {
                    self.router.register(r.id, self.mailbox_tx.clone());
                }
                schedule_periodic(
                    &self.schedulers.pd,
                    Task::Pd(PdTask::ReportBatchSplit {
                        regions: regions.clone(),
                    }),
                );
            }
            Err(e) => tracing::warn!(region_id, error = %e, "split failed"),
        }
        if let Some(cb) = callback {
            cb(res);
        }
    }

    fn destroy_region(&mut self, region_id: RegionId) {
        match self.regions.remove(region_id) {
            Ok(Some(region)) => {
                self.router.unregister(region_id);
                tracing::info!(region_id, "stale peer, destroying region data");
                schedule_periodic(
                    &self.schedulers.region,
                    Task::Region(RegionTask::Destroy {
                        region_id,
                        start_key: region.start_key,
                        end_key: region.end_key,
                    }),
                );
            }
            Ok(None) => {}
            Err(e) => tracing::error!(region_id, error = %e, "failed to remove region meta"),
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if due(&mut self.timers.split_check, now) {
            for region in self.regions.regions() {
                schedule_periodic(
                    &self.schedulers.split_check,
                    Task::SplitCheck(SplitCheckTask {
                        region,
                        auto_split: true,
                        policy: self.cfg.split_check.policy,
                    }),
                );
            }
        }
        if due(&mut self.timers.pd_heartbeat, now) {
            self.on_pd_heartbeat_tick();
        }
        if due(&mut self.timers.store_heartbeat, now) {
            let stats = StoreStats {
                store_id: self.store_id,
                region_count: self.regions.len() as u64,
                ..Default::default()
            };
            schedule_periodic(
                &self.schedulers.pd,
                Task::Pd(PdTask::StoreHeartbeat {
                    stats,
                    engine: self.engine.clone(),
                    capacity: self.cfg.raftstore.capacity,
                }),
            );
        }
        if due(&mut self.timers.compact_check, now) {
            let ranges = self
                .regions
                .regions()
                .iter()
                .map(|r| {
                    let (start, end) = data_range(&r.start_key, &r.end_key);
                    KeyRange { start, end }
                })
                .collect();
            schedule_periodic(
                &self.schedulers.compact,
                Task::CheckAndCompact(CheckAndCompactTask {
                    ranges,
                    tombstone_num_threshold: self.cfg.compaction.tombstone_num_threshold,
                    tombstone_percent_threshold: self.cfg.compaction.tombstone_percent_threshold,
                }),
            );
        }
    }

    fn on_pd_heartbeat_tick(&mut self) {
        let reads = self.server.take_read_stats();
        if !reads.is_empty() {
            schedule_periodic(&self.schedulers.pd, Task::Pd(PdTask::ReadStats(reads)));
        }
        for region in self.regions.regions() {
            let (start, end) = data_range(&region.start_key, &region.end_key);
            let writes = self.engine.range_properties(Cf::Write, &start, Some(&end));
            let values = self.engine.range_properties(Cf::Default, &start, Some(&end));
            let leader = region.find_peer(self.store_id).copied().unwrap_or_default();
            schedule_periodic(
                &self.schedulers.pd,
                Task::Pd(PdTask::Heartbeat(RegionHeartbeat {
                    region: region.clone(),
                    leader,
                    approximate_size: writes.total_size + values.total_size,
                    approximate_keys: writes.num_keys,
                    ..Default::default()
                })),
            );
            schedule_periodic(
                &self.schedulers.pd,
                Task::Pd(PdTask::ValidatePeer {
                    region,
                    peer: leader,
                    merge_source: None,
                }),
            );
        }
    }
}
