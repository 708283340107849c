//! Shutdown barrier shared by the background workers of a node.
//!
//! Each worker registers itself with [`ShutdownBarrier::add`] before its
//! consumer thread starts and calls [`ShutdownBarrier::done`] when the thread
//! exits. The node waits on the barrier after sending `Stop` to every worker.
//!
//! ```ignore
//! let barrier = ShutdownBarrier::new();
//! barrier.add(1);
//! let b = barrier.clone();
//! std::thread::spawn(move || {
//!     // consume tasks until Stop ...
//!     b.done();
//! });
//! barrier.wait();
//! ```

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ShutdownBarrier {
    inner: Arc<BarrierInner>,
}

struct BarrierInner {
    pending: Mutex<usize>,
    condvar: Condvar,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BarrierInner {
                pending: Mutex::new(0),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Register `n` participants that will each call `done()` once.
    pub fn add(&self, n: usize) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending += n;
    }

    /// Mark one participant finished. Wakes waiters when the count hits zero.
    pub fn done(&self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.inner.condvar.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until every registered participant called `done()`.
    pub fn wait(&self) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .inner
                .condvar
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like `wait`, bounded by `timeout`. Returns `true` if all participants
    /// finished in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .condvar
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            pending = guard;
        }
        true
    }
}

impl Default for ShutdownBarrier {
    fn default() -> Self {
        Self::new()
    }
}
