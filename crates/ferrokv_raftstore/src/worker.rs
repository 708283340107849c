//! Single-consumer background workers with bounded queues.
//!
//! A [`Worker`] owns one thread that drains its queue in FIFO order and
//! hands each task to a [`Runnable`]. Producers hold cloneable
//! [`Scheduler`]s. When the queue is full, `schedule` blocks the producer
//! and records a backpressure event; `try_schedule` returns the task back
//! instead.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ferrokv_common::{KvResult, ShutdownBarrier};
use ferrokv_observability as obs;
use thiserror::Error;
use tracing::Span;

use crate::task::Task;

pub const DEFAULT_WORKER_CAPACITY: usize = 128;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Executes tasks on a worker thread.
///
/// A returned error is logged and the task is dropped; the worker keeps
/// running.
pub trait Runnable: Send + 'static {
    fn run(&mut self, task: Task) -> KvResult<()>;

    /// Called when the queue stayed empty for one tick interval.
    fn on_tick(&mut self) {}

    /// Called once on the worker thread after `Stop` is received.
    fn shutdown(&mut self) {}
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("worker {worker} queue is full")]
    Full { worker: String, task: Task },

    #[error("worker {worker} is stopped")]
    Stopped { worker: String, task: Task },
}

impl ScheduleError {
    pub fn into_task(self) -> Task {
        match self {
            ScheduleError::Full { task, .. } | ScheduleError::Stopped { task, .. } => task,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    scheduled: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    backpressure: AtomicU64,
    /// Tasks sitting in the queue, `Stop` included.
    pending: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub scheduled: u64,
    pub executed: u64,
    pub failed: u64,
    pub backpressure: u64,
    pub pending: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    fn enqueued(&self, worker: &str) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        obs::record_worker_pending(worker, self.pending.load(Ordering::Relaxed) as usize);
    }

    fn dequeued(&self, worker: &str) {
        let pending = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        obs::record_worker_pending(worker, pending as usize);
    }
}

/// Producer handle of a worker's queue.
#[derive(Clone)]
pub struct Scheduler {
    name: Arc<str>,
    sender: SyncSender<Task>,
    stopped: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

impl Scheduler {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `task`, blocking while the queue is full.
    pub fn schedule(&self, task: Task) -> Result<(), ScheduleError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(self.stopped_err(task));
        }
        if matches!(task, Task::Stop) {
            self.stopped.store(true, Ordering::Release);
        }
        // Raised before the send; the consumer lowers it on receive.
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let task = match self.sender.try_send(task) {
            Ok(()) => {
                self.stats.enqueued(&self.name);
                return Ok(());
            }
            Err(TrySendError::Disconnected(task)) => {
                self.stats.pending.fetch_sub(1, Ordering::Relaxed);
                return Err(self.stopped_err(task));
            }
            Err(TrySendError::Full(task)) => task,
        };

        self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
        obs::record_worker_backpressure(&self.name);
        tracing::warn!(worker = %self.name, task = %task.kind(), "worker queue full, producer blocked");
        match self.sender.send(task) {
            Ok(()) => {
                self.stats.enqueued(&self.name);
                Ok(())
            }
            Err(mpsc::SendError(task)) => {
                self.stats.pending.fetch_sub(1, Ordering::Relaxed);
                Err(self.stopped_err(task))
            }
        }
    }

    /// Enqueue `task` without blocking.
    pub fn try_schedule(&self, task: Task) -> Result<(), ScheduleError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(self.stopped_err(task));
        }
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let res = self.sender.try_send(task);
        if res.is_err() {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        }
        match res {
            Ok(()) => {
                self.stats.enqueued(&self.name);
                Ok(())
            }
            Err(TrySendError::Full(task)) => {
                self.stats.backpressure.fetch_add(1, Ordering::Relaxed);
                obs::record_worker_backpressure(&self.name);
                Err(ScheduleError::Full {
                    worker: self.name.to_string(),
                    task,
                })
            }
            Err(TrySendError::Disconnected(task)) => Err(self.stopped_err(task)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Times a producer found the queue full.
    pub fn backpressure_events(&self) -> u64 {
        self.stats.backpressure.load(Ordering::Relaxed)
    }

    fn stopped_err(&self, task: Task) -> ScheduleError {
        ScheduleError::Stopped {
            worker: self.name.to_string(),
            task,
        }
    }
}

pub struct Worker {
    name: String,
    scheduler: Scheduler,
    receiver: Option<Receiver<Task>>,
    handle: Option<JoinHandle<()>>,
    barrier: ShutdownBarrier,
    tick_interval: Duration,
    span: Span,
}

impl Worker {
    pub fn new(name: impl Into<String>, capacity: usize, barrier: ShutdownBarrier) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let scheduler = Scheduler {
            name: Arc::from(name.as_str()),
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(WorkerStats::default()),
        };
        Self {
            name,
            scheduler,
            receiver: Some(receiver),
            handle: None,
            barrier,
            tick_interval: DEFAULT_TICK_INTERVAL,
            span: Span::none(),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Span the consumer thread enters for its whole lifetime.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Spawn the consumer thread. A worker can be started once.
    pub fn start<R: Runnable>(&mut self, mut runner: R) -> std::io::Result<()> {
        let receiver = self.receiver.take().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("worker {} already started", self.name),
            )
        })?;
        let name = self.name.clone();
        let tick = self.tick_interval;
        let barrier = self.barrier.clone();
        let stats = Arc::clone(&self.scheduler.stats);
        let span = self.span.clone();

        self.barrier.add(1);
        let spawned = std::thread::Builder::new()
            .name(format!("ferrokv-{}", name))
            .spawn(move || {
                let _enter = span.enter();
                tracing::info!(worker = %name, "worker started");
                loop {
                    let received = receiver.recv_timeout(tick);
                    if received.is_ok() {
                        stats.dequeued(&name);
                    }
                    match received {
                        Ok(Task::Stop) => break,
                        Ok(task) => run_task(&name, &mut runner, task, &stats),
                        Err(RecvTimeoutError::Timeout) => runner.on_tick(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                runner.shutdown();
                tracing::info!(worker = %name, "worker stopped");
                barrier.done();
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.barrier.done();
                tracing::error!(worker = %self.name, error = %e, "failed to spawn worker thread");
                Err(e)
            }
        }
    }

    /// Enqueue `Stop` behind the already queued tasks.
    pub fn stop(&self) -> Result<(), ScheduleError> {
        self.scheduler.schedule(Task::Stop)
    }

    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if !self.scheduler.is_stopped() {
                let _ = self.stop();
            }
            self.join();
        }
    }
}

fn run_task<R: Runnable>(name: &str, runner: &mut R, task: Task, stats: &WorkerStats) {
    let kind = task.kind();
    let region_id = task.region_id();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(task)));
    let ok = match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(worker = %name, task = %kind, ?region_id, error = %e, "task failed, dropped");
            false
        }
        Err(_) => {
            tracing::error!(worker = %name, task = %kind, ?region_id, "task panicked, dropped");
            false
        }
    };
    if ok {
        stats.executed.fetch_add(1, Ordering::Relaxed);
    } else {
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }
    obs::record_worker_task(name, kind.as_str(), ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RegionTask, TaskKind};
    use ferrokv_common::KvError;
    use parking_lot::Mutex;
    use std::sync::mpsc::Sender;

    fn destroy(region_id: u64) -> Task {
        Task::Region(RegionTask::Destroy {
            region_id,
            start_key: vec![],
            end_key: vec![],
        })
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
        ticks: Arc<AtomicU64>,
        gate: Option<Receiver<()>>,
        shutdown_tx: Option<Sender<()>>,
    }

    impl Runnable for Recorder {
        fn run(&mut self, task: Task) -> KvResult<()> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            let id = task.region_id().unwrap_or(0);
            self.seen.lock().push(id);
            if id == 13 {
                return Err(KvError::Internal("unlucky".into()));
            }
            if id == 66 {
                panic!("runner bug");
            }
            Ok(())
        }

        fn on_tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }

        fn shutdown(&mut self) {
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn recorder() -> (Recorder, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Recorder {
                seen: seen.clone(),
                ticks: Arc::new(AtomicU64::new(0)),
                gate: None,
                shutdown_tx: None,
            },
            seen,
        )
    }

    #[test]
    fn test_fifo_and_stop_drops_later_tasks() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("fifo", 16, barrier.clone());
        let (mut runner, seen) = recorder();
        let (gate_tx, gate_rx) = mpsc::channel();
        runner.gate = Some(gate_rx);
        worker.start(runner).unwrap();

        let sched = worker.scheduler();
        for id in 1..=3 {
            sched.schedule(destroy(id)).unwrap();
        }
        worker.stop().unwrap();
        // Rejected after Stop.
        let err = sched.schedule(destroy(4)).unwrap_err();
        assert!(matches!(err, ScheduleError::Stopped { .. }));
        assert_eq!(err.into_task().region_id(), Some(4));

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
        worker.join();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_and_panicking_tasks_do_not_kill_worker() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("faulty", 16, barrier.clone());
        let (runner, seen) = recorder();
        worker.start(runner).unwrap();
        let sched = worker.scheduler();
        for id in [13, 66, 5] {
            sched.schedule(destroy(id)).unwrap();
        }
        worker.stop().unwrap();
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![13, 66, 5]);
        let stats = sched.stats();
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.failed, 2);
    }

    #[test]
    fn test_pending_tracks_queue_depth() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("depth", 8, barrier.clone());
        let sched = worker.scheduler();
        for id in 1..=3 {
            sched.schedule(destroy(id)).unwrap();
        }
        sched.try_schedule(destroy(4)).unwrap();
        assert_eq!(sched.stats().pending, 4);
        assert_eq!(sched.stats().scheduled, 4);

        let (runner, seen) = recorder();
        worker.start(runner).unwrap();
        worker.stop().unwrap();
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
        assert_eq!(seen.lock().len(), 4);
        assert_eq!(sched.stats().pending, 0);
    }

    #[test]
    fn test_try_schedule_reports_full_queue() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("tiny", 1, barrier.clone());
        let (mut runner, seen) = recorder();
        let (gate_tx, gate_rx) = mpsc::channel();
        runner.gate = Some(gate_rx);
        worker.start(runner).unwrap();
        let sched = worker.scheduler();

        // First task is taken by the consumer and parks on the gate, the
        // second fills the one-slot queue.
        sched.schedule(destroy(1)).unwrap();
        let mut queued = 0;
        let mut full = None;
        for id in 2..10 {
            match sched.try_schedule(destroy(id)) {
                Ok(()) => queued += 1,
                Err(e) => {
                    full = Some(e);
                    break;
                }
            }
        }
        let err = full.expect("queue never reported full");
        assert!(matches!(err, ScheduleError::Full { .. }));
        assert!(sched.backpressure_events() >= 1);

        for _ in 0..(1 + queued) {
            gate_tx.send(()).unwrap();
        }
        worker.stop().unwrap();
        gate_tx.send(()).ok();
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
        assert_eq!(seen.lock().len(), 1 + queued);
    }

    #[test]
    fn test_schedule_blocks_until_space() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("blocking", 1, barrier.clone());
        let (mut runner, seen) = recorder();
        let (gate_tx, gate_rx) = mpsc::channel();
        runner.gate = Some(gate_rx);
        worker.start(runner).unwrap();
        let sched = worker.scheduler();

        let producer = {
            let sched = sched.clone();
            std::thread::spawn(move || {
                for id in 1..=4 {
                    sched.schedule(destroy(id)).unwrap();
                }
            })
        };
        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }
        producer.join().unwrap();
        worker.stop().unwrap();
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_idle_ticks_and_shutdown_hook() {
        let barrier = ShutdownBarrier::new();
        let mut worker =
            Worker::new("ticker", 4, barrier.clone()).with_tick_interval(Duration::from_millis(5));
        let (mut runner, _) = recorder();
        let ticks = runner.ticks.clone();
        let (tx, rx) = mpsc::channel();
        runner.shutdown_tx = Some(tx);
        worker.start(runner).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        worker.stop().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(ticks.load(Ordering::Relaxed) > 0);
        assert!(barrier.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_start_twice_fails() {
        let barrier = ShutdownBarrier::new();
        let mut worker = Worker::new("twice", 4, barrier);
        worker.start(recorder().0).unwrap();
        let err = worker.start(recorder().0).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert!(worker.is_running());
        assert_eq!(TaskKind::Stop.as_str(), "stop");
    }
}
