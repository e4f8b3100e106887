//! The auto-scaling set of workers behind one acquire/release semaphore.
//!
//! `available` is a bounded channel of capacity `max`: each slot in flight
//! represents one idle, ready-to-use worker. Pushing into it is always a
//! non-blocking `try_send` (a full channel just means the push is dropped,
//! which only happens if our own bookkeeping is wrong), and popping from it
//! is the only way `Acquire` is satisfied. `available_count` mirrors the
//! channel's occupancy so the scale-down loop can ask "is anything idle
//! right now" without draining the channel to find out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::types::{OrchestratorError, Result};
use crate::worker::{CrashHandler, Worker, WorkerSnapshot};

pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub binary_path: String,
}

struct PoolInner {
    workers: Vec<Arc<Worker>>,
    next_id: u64,
    pending_adds: usize,
}

pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    available_tx: mpsc::Sender<Arc<Worker>>,
    available_rx: Mutex<mpsc::Receiver<Arc<Worker>>>,
    available_count: Arc<AtomicUsize>,
    min: usize,
    max: usize,
    binary_path: Arc<str>,
    http: reqwest::Client,
    crash_handler: CrashHandler,
}

#[derive(Debug, serde::Serialize)]
pub struct PoolSnapshot {
    pub min: usize,
    pub max: usize,
    pub pending_adds: usize,
    pub available_depth: usize,
    pub workers: Vec<WorkerSnapshot>,
}

impl WorkerPool {
    /// Spawns the first `min` workers synchronously; a spawn failure among
    /// them is fatal, since a pool that can't reach its floor on startup
    /// isn't one the rest of the process should run against.
    pub async fn new(config: PoolConfig, crash_handler: CrashHandler) -> Result<Arc<WorkerPool>> {
        let (tx, rx) = mpsc::channel(config.max_workers.max(1));
        let pool = Arc::new(WorkerPool {
            inner: Mutex::new(PoolInner {
                workers: Vec::new(),
                next_id: 0,
                pending_adds: 0,
            }),
            available_tx: tx,
            available_rx: Mutex::new(rx),
            available_count: Arc::new(AtomicUsize::new(0)),
            min: config.min_workers,
            max: config.max_workers,
            binary_path: Arc::from(config.binary_path.as_str()),
            http: reqwest::Client::new(),
            crash_handler,
        });

        for _ in 0..pool.min {
            let reserved = pool.reserve_scale_up_slot().await;
            debug_assert!(reserved, "min must not exceed max");
            pool.complete_scale_up().await?;
        }

        tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.health_loop().await }
        });
        tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.scale_down_loop().await }
        });

        Ok(pool)
    }

    /// Blocks until a ready worker is available or `deadline` elapses.
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<Arc<Worker>> {
        let deadline_at = Instant::now() + deadline;

        loop {
            let popped = {
                let mut rx = self.available_rx.lock().await;
                rx.try_recv().ok()
            };
            if let Some(w) = popped {
                self.available_count.fetch_sub(1, Ordering::SeqCst);
                if w.is_available() {
                    return Ok(w);
                }
                continue; // crashed while idle; discard and keep looking
            }

            self.maybe_scale_up().await;

            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::AcquireTimeout);
            }

            let pool = Arc::clone(self);
            let recv = async move {
                let mut rx = pool.available_rx.lock().await;
                rx.recv().await
            };

            match tokio::time::timeout(remaining, recv).await {
                Ok(Some(w)) => {
                    self.available_count.fetch_sub(1, Ordering::SeqCst);
                    if w.is_available() {
                        return Ok(w);
                    }
                    continue;
                }
                Ok(None) => return Err(OrchestratorError::AcquireTimeout),
                Err(_) => return Err(OrchestratorError::AcquireTimeout),
            }
        }
    }

    /// Returns a worker to the idle set. A no-op if it's already idle or
    /// dead; the real guard lives in `Worker::set_session`.
    pub fn release(&self, worker: &Arc<Worker>) {
        worker.release();
    }

    pub async fn find_by_session(&self, session_id: &str) -> Option<Arc<Worker>> {
        let inner = self.inner.lock().await;
        inner.workers.iter().find(|w| w.holds_session(session_id)).cloned()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().await;
        PoolSnapshot {
            min: self.min,
            max: self.max,
            pending_adds: inner.pending_adds,
            available_depth: self.available_count.load(Ordering::SeqCst),
            workers: inner.workers.iter().map(|w| w.snapshot()).collect(),
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    /// Drains and kills every worker. Monitors observe the kill, see
    /// `draining`, and do not restart.
    pub async fn shutdown(self: &Arc<Self>) {
        let workers = { self.inner.lock().await.workers.clone() };
        for w in workers {
            w.drain();
            w.kill();
        }
    }

    /// Reserves a slot in the worker set under the lock, before any slow
    /// I/O happens. Returns whether a slot was reserved.
    async fn reserve_scale_up_slot(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.workers.len() + inner.pending_adds < self.max {
            inner.pending_adds += 1;
            true
        } else {
            false
        }
    }

    async fn maybe_scale_up(self: &Arc<Self>) {
        if self.reserve_scale_up_slot().await {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = pool.complete_scale_up().await {
                    tracing::warn!(error = %e, "scale-up failed");
                }
            });
        }
    }

    /// Spawns the reserved worker and, on success, appends it to the worker
    /// set; on failure just releases the reservation. Always balances the
    /// `pending_adds` increment from `reserve_scale_up_slot`.
    async fn complete_scale_up(self: &Arc<Self>) -> Result<()> {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let worker = Worker::new(
            id,
            self.available_tx.clone(),
            Arc::clone(&self.available_count),
            Arc::clone(&self.crash_handler),
        );
        let result = worker.start(Arc::clone(&self.binary_path), self.http.clone()).await;

        let mut inner = self.inner.lock().await;
        inner.pending_adds -= 1;
        match result {
            Ok(()) => {
                inner.workers.push(worker);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let workers: Vec<Arc<Worker>> = { self.inner.lock().await.workers.clone() };
            for w in workers {
                use crate::worker::WorkerState;
                if matches!(w.state(), WorkerState::Starting | WorkerState::Dead) {
                    continue;
                }
                if !w.health_check(&self.http).await {
                    tracing::warn!(worker_id = w.id, "health check failed, killing worker");
                    w.kill();
                }
            }
        }
    }

    async fn scale_down_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(10));
        let mut consecutive_idle_ticks = 0u32;
        loop {
            ticker.tick().await;

            let has_idle = self.available_count.load(Ordering::SeqCst) > 0;
            let above_min = { self.inner.lock().await.workers.len() > self.min };

            if has_idle && above_min {
                consecutive_idle_ticks += 1;
            } else {
                consecutive_idle_ticks = 0;
            }

            if consecutive_idle_ticks >= 2 && self.remove_one_idle_worker().await {
                consecutive_idle_ticks = 0;
            }
        }
    }

    async fn remove_one_idle_worker(self: &Arc<Self>) -> bool {
        let popped = {
            let mut rx = self.available_rx.lock().await;
            rx.try_recv().ok()
        };
        let Some(worker) = popped else {
            return false;
        };
        self.available_count.fetch_sub(1, Ordering::SeqCst);

        if !worker.is_available() {
            return false; // stale entry for a worker that already crashed
        }

        {
            let mut inner = self.inner.lock().await;
            inner.workers.retain(|w| w.id != worker.id);
        }

        tracing::info!(worker_id = worker.id, "scaling down idle worker");
        worker.drain();
        worker.kill();
        true
    }
}
