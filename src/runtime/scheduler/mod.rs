//! Work-stealing scheduler
//!
//! A fixed pool of threads, one work queue each, cooperating through the
//! shared [`ThreadPool`](pool::ThreadPool): work stealing for load balance,
//! a circulating token per thread for checkpointing, and a multi-phase
//! leak-detection protocol that reclaims unreachable cown cycles.

pub mod pool;
pub mod queue;
pub mod state;
pub mod stats;
pub mod thread;

pub use state::ThreadState;
pub use stats::SchedulerStats;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::runtime::cown::{Behaviour, BehaviourCtx, CownRef, CownState};
use crate::runtime::epoch::EpochMark;
use crate::{Context as _, Result};

use self::pool::ThreadPool;
use self::thread::Worker;

/// Per-thread startup hook, called with the worker index.
pub type ThreadStartFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Scheduler tuning knobs.
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Scheduler threads in the pool.
    pub num_workers: usize,
    /// Fair mode: each return of a thread's token triggers one steal from
    /// a peer, bounding how long remote work can be ignored.
    pub fair: bool,
    /// Messages a cown may run per scheduling before yielding its slot.
    pub batch_limit: usize,
    /// Upper bound on one bounded pause of an idle thread.
    pub idle_pause: Duration,
    /// Stop the pool when every thread is idle with nothing queued and
    /// nothing in flight.
    pub terminate_on_quiescence: bool,
    /// Behaviours a thread runs before it requests a leak-detection round
    /// on its own. `None` leaves rounds to explicit requests.
    pub ld_threshold: Option<usize>,
    /// Runs on every scheduler thread before it starts taking work, for
    /// embedder thread-local initialisation.
    pub on_thread_start: Option<ThreadStartFn>,
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("num_workers", &self.num_workers)
            .field("fair", &self.fair)
            .field("batch_limit", &self.batch_limit)
            .field("idle_pause", &self.idle_pause)
            .field("terminate_on_quiescence", &self.terminate_on_quiescence)
            .field("ld_threshold", &self.ld_threshold)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .finish()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            fair: false,
            batch_limit: 100,
            idle_pause: Duration::from_millis(1),
            terminate_on_quiescence: true,
            ld_threshold: None,
            on_thread_start: None,
        }
    }
}

/// A running scheduler: the pool plus its thread handles.
///
/// Work enters either through the entry behaviour given at start, or
/// externally through [`send`](Self::send) and the `schedule_*` injection
/// points. With `terminate_on_quiescence` set (the default),
/// [`join`](Self::join) returns once every message has run and every
/// thread has gone idle.
#[derive(Debug)]
pub struct Scheduler {
    pool: Arc<ThreadPool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start a pool and run `entry` against a fresh unit cown.
    pub fn start<F>(config: SchedulerConfig, entry: F) -> Result<Self>
    where
        F: FnOnce(&mut BehaviourCtx<'_>) + Send + 'static,
    {
        Self::start_boxed(config, Box::new(entry))
    }

    /// Start a pool and run a program entry point.
    pub fn start_entry(config: SchedulerConfig, entry: crate::program::EntryPoint) -> Result<Self> {
        Self::start_boxed(config, entry.into_body())
    }

    pub(crate) fn start_boxed(config: SchedulerConfig, entry: Behaviour) -> Result<Self> {
        let pool = ThreadPool::new(config);
        let mut workers = Vec::with_capacity(pool.num_threads());
        for idx in 0..pool.num_threads() {
            let worker = Worker::new(idx, Arc::clone(&pool));
            let handle = std::thread::Builder::new()
                .name(format!("corral-worker-{idx}"))
                .spawn(move || worker.run())
                .context("failed to spawn scheduler thread")?;
            workers.push(handle);
        }
        tracing::info!(workers = workers.len(), "scheduler started");

        // The entry behaviour runs against a bootstrap cown that is
        // dropped as soon as the behaviour completes.
        let boot = pool.create_cown((), false);
        pool.send_from(None, EpochMark::None, boot.ptr(), entry);
        drop(boot);

        Ok(Self { pool, workers })
    }

    /// Create a cown from outside the pool.
    pub fn create_cown<T: CownState>(&self, state: T) -> CownRef {
        self.pool.create_cown(state, false)
    }

    /// Create a cown eligible for LIFO injection.
    pub fn create_lifo_cown<T: CownState>(&self, state: T) -> CownRef {
        self.pool.create_cown(state, true)
    }

    /// Send a behaviour to `target` from outside the pool.
    pub fn send<F>(&self, target: &CownRef, behaviour: F)
    where
        F: FnOnce(&mut BehaviourCtx<'_>) + Send + 'static,
    {
        self.pool
            .send_from(None, EpochMark::None, target.ptr(), Box::new(behaviour));
    }

    /// Inject an already-woken cown at the back of some queue. No-op while
    /// the cown is queued or running.
    pub fn schedule_fifo(&self, cown: &CownRef) {
        self.pool.schedule_fifo(cown.ptr());
    }

    /// Inject ahead of queued backlog, for work that completed externally.
    pub fn schedule_lifo(&self, cown: &CownRef) {
        self.pool.schedule_lifo(cown.ptr());
    }

    /// Ask for a leak-detection round.
    pub fn request_leak_detection(&self) {
        self.pool.request_leak_detection();
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.pool.stats
    }

    /// Cowns still alive in the arena (including uncollected stubs).
    pub fn live_cowns(&self) -> usize {
        self.pool.arena.len()
    }

    /// Completed leak-detection rounds.
    pub fn ld_rounds(&self) -> u64 {
        self.pool.coordinator.rounds()
    }

    /// Wait for the pool to stop (quiescence or an explicit stop).
    /// Idempotent; stats remain readable afterwards.
    pub fn join(&mut self) -> Result<()> {
        self.join_workers()
    }

    /// Stop the pool without waiting for quiescence; in-flight batches
    /// finish, queued work is dropped.
    pub fn stop(&mut self) -> Result<()> {
        self.pool.shutdown();
        self.join_workers()
    }

    fn join_workers(&mut self) -> Result<()> {
        for handle in self.workers.drain(..) {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("scheduler thread panicked"))?;
        }
        // Threads are gone; settle whatever the arena still holds.
        for cown in self.pool.arena.drain() {
            if let Some(msgs) = cown.inner.collect() {
                self.pool.settle(msgs);
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}
