//! # Worker Pools
//!
//! Named, monitored execution pools over the tokio runtime. Subsystems
//! that need "run this somewhere else" submit boxed async jobs to a named
//! pool and get per-pool counters (active, queued, completed, failed,
//! latency) for free. Pools shut down gracefully with a deadline: intake
//! closes, queued work drains, and whatever outlives the deadline is
//! aborted rather than waited on forever.
//!
//! The pool registry is process-wide plumbing, not a global: the owner
//! creates a [`WorkerPools`] value and hands it to whoever needs one.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ShoalError};

/// Queue depth per pool before `submit` pushes back.
const POOL_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Kinds & metrics
// ---------------------------------------------------------------------------

/// Pool shapes, mirroring the classic executor menagerie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// No queue: every job spawns immediately.
    Cached,
    /// `n` workers draining one queue.
    Fixed(usize),
    /// One worker, one queue; jobs run strictly in submission order.
    Single,
    /// `n` workers plus support for repeating jobs.
    Scheduled(usize),
    /// One worker plus support for repeating jobs.
    SingleScheduled,
}

impl PoolKind {
    fn worker_count(&self) -> usize {
        match self {
            Self::Cached => 0,
            Self::Fixed(n) | Self::Scheduled(n) => (*n).max(1),
            Self::Single | Self::SingleScheduled => 1,
        }
    }
}

/// Live counters for one pool.
#[derive(Default)]
struct Counters {
    active: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub name: String,
    pub active: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

type Job = BoxFuture<'static, Result<()>>;

struct QueuedJob {
    job: Job,
    enqueued_at: Instant,
}

/// One named worker pool.
pub struct WorkerPool {
    name: String,
    kind: PoolKind,
    counters: Arc<Counters>,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    fn new(name: &str, kind: PoolKind) -> Arc<Self> {
        let counters = Arc::new(Counters {
            min_latency_ms: AtomicU64::new(u64::MAX),
            ..Counters::default()
        });
        let (shutdown, _) = watch::channel(false);

        let pool = Arc::new(Self {
            name: name.to_string(),
            kind,
            counters: Arc::clone(&counters),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            shutdown,
        });

        let worker_count = kind.worker_count();
        if worker_count > 0 {
            let (tx, rx) = mpsc::channel::<QueuedJob>(POOL_QUEUE_CAPACITY);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            *pool.sender.lock() = Some(tx);

            let mut workers = pool.workers.lock();
            for worker_id in 0..worker_count {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                let pool_name = pool.name.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(queued) = next else { break };
                        counters.queued.fetch_sub(1, Ordering::Relaxed);
                        run_job(&counters, queued).await;
                    }
                    debug!(pool = %pool_name, worker_id, "pool worker drained");
                }));
            }
        }

        debug!(pool = %name, ?kind, "worker pool created");
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Submits a job. Cached pools spawn immediately; queued pools push
    /// onto the queue and fail with `Unavailable` when shut down or full.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let queued = QueuedJob {
            job: Box::pin(job),
            enqueued_at: Instant::now(),
        };

        if self.kind == PoolKind::Cached {
            let counters = Arc::clone(&self.counters);
            let mut workers = self.workers.lock();
            workers.retain(|h| !h.is_finished());
            workers.push(tokio::spawn(async move {
                run_job(&counters, queued).await;
            }));
            return Ok(());
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(ShoalError::unavailable(format!(
                "pool '{}' is shut down",
                self.name
            )));
        };
        match sender.try_send(queued) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ShoalError::Unavailable {
                reason: format!("pool '{}' queue is full", self.name),
                retry_after_ms: Some(50),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ShoalError::unavailable(format!(
                "pool '{}' is shut down",
                self.name
            ))),
        }
    }

    /// Runs `make_job` every `interval` until the pool shuts down. Only
    /// meaningful on the scheduled kinds; other kinds reject it.
    pub fn schedule_repeating<F>(&self, interval: Duration, mut make_job: F) -> Result<()>
    where
        F: FnMut() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + 'static,
    {
        if !matches!(self.kind, PoolKind::Scheduled(_) | PoolKind::SingleScheduled) {
            return Err(ShoalError::InvalidArgument(format!(
                "pool '{}' ({:?}) does not run scheduled jobs",
                self.name, self.kind
            )));
        }

        let counters = Arc::clone(&self.counters);
        let mut shutdown = self.shutdown.subscribe();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // immediate first tick is not wanted
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        let queued = QueuedJob { job: make_job(), enqueued_at: Instant::now() };
                        run_job(&counters, queued).await;
                    }
                }
            }
            debug!(pool = %name, "scheduled job stopped");
        });
        self.workers.lock().push(handle);
        Ok(())
    }

    pub fn metrics(&self) -> PoolMetrics {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total = self.counters.total_latency_ms.load(Ordering::Relaxed);
        let finished = completed + failed;
        let min = self.counters.min_latency_ms.load(Ordering::Relaxed);
        PoolMetrics {
            name: self.name.clone(),
            active: self.counters.active.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            completed,
            failed,
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            avg_latency_ms: if finished == 0 { 0 } else { total / finished },
            max_latency_ms: self.counters.max_latency_ms.load(Ordering::Relaxed),
        }
    }

    /// Graceful shutdown: closes intake, waits up to `deadline` for
    /// workers to drain, aborts the stragglers.
    pub async fn shutdown(&self, deadline: Duration) {
        *self.sender.lock() = None; // closes the channel; workers drain and exit
        let _ = self.shutdown.send(true);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let drain = async {
            for handle in &workers {
                // JoinHandle is not cancel-safe to poll twice; abort below
                // covers whatever we time out on.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            let leftovers = workers.iter().filter(|h| !h.is_finished()).count();
            warn!(pool = %self.name, leftovers, "shutdown deadline hit, aborting workers");
            for handle in &workers {
                handle.abort();
            }
        }
        info!(pool = %self.name, "worker pool shut down");
    }
}

async fn run_job(counters: &Counters, queued: QueuedJob) {
    counters.active.fetch_add(1, Ordering::Relaxed);
    let outcome = queued.job.await;
    counters.active.fetch_sub(1, Ordering::Relaxed);

    let latency = queued.enqueued_at.elapsed().as_millis() as u64;
    counters.total_latency_ms.fetch_add(latency, Ordering::Relaxed);
    counters.min_latency_ms.fetch_min(latency, Ordering::Relaxed);
    counters.max_latency_ms.fetch_max(latency, Ordering::Relaxed);

    match outcome {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "pool job failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Registry of pools
// ---------------------------------------------------------------------------

/// The process-wide set of named pools.
#[derive(Default)]
pub struct WorkerPools {
    pools: DashMap<String, Arc<WorkerPool>>,
}

impl WorkerPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named pool, creating it with `kind` on first use. The
    /// kind of an existing pool wins; callers asking for a different kind
    /// under the same name get the original.
    pub fn get_or_create(&self, name: &str, kind: PoolKind) -> Arc<WorkerPool> {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| WorkerPool::new(name, kind))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerPool>> {
        self.pools.get(name).map(|e| e.value().clone())
    }

    pub fn metrics(&self) -> Vec<PoolMetrics> {
        self.pools.iter().map(|e| e.value().metrics()).collect()
    }

    /// Drains every pool, sharing the deadline across them. The process
    /// shutdown hook calls this exactly once.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let pools: Vec<Arc<WorkerPool>> =
            self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        futures::future::join_all(pools.iter().map(|pool| pool.shutdown(deadline))).await;
    }
}

// ---------------------------------------------------------------------------
// Async chains
// ---------------------------------------------------------------------------

/// Runs steps in order, failing fast on the first error.
pub async fn chain_sequential<T>(steps: Vec<BoxFuture<'_, Result<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(steps.len());
    for step in steps {
        results.push(step.await?);
    }
    Ok(results)
}

/// Runs steps concurrently; fails if any step failed, succeeds with all
/// results in input order otherwise.
pub async fn chain_parallel<T>(steps: Vec<BoxFuture<'_, Result<T>>>) -> Result<Vec<T>> {
    futures::future::join_all(steps)
        .await
        .into_iter()
        .collect()
}
