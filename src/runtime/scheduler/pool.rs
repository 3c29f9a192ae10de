//! Thread pool: the coordinator shared by every scheduler thread
//!
//! Owns the global leak-detection phase, the pause/unpause facility, the
//! round-robin ring of per-thread queues used for stealing, the cown arena
//! and the reclamation epoch. Worker-local state lives in
//! [`Worker`](super::thread::Worker); everything here is shared and either
//! atomic or lock-free on the hot paths.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crate::runtime::cown::{
    Behaviour, CownArena, CownPtr, CownRef, CownState, Enqueue, Message,
};
use crate::runtime::epoch::{EpochCell, EpochMark, GlobalEpoch};
use crate::runtime::scheduler::queue::{QueueEntry, WorkQueue};
use crate::runtime::scheduler::state::StateCoordinator;
use crate::runtime::scheduler::stats::SchedulerStats;
use crate::runtime::scheduler::SchedulerConfig;

/// Cross-thread view of one scheduler thread: its queue and the small set
/// of flags written by peers.
#[derive(Debug)]
pub struct ThreadShared {
    pub(crate) queue: WorkQueue,
    /// Set by whichever thread pops this thread's token; cleared by the
    /// owner when it re-enqueues a fresh token.
    pub(crate) token_consumed: AtomicBool,
    /// An unscanned cown was scheduled onto this thread during a scan
    /// window.
    pub(crate) scheduled_unscanned: AtomicBool,
    /// Collected cowns still bound to this thread's ownership list.
    pub(crate) free_cowns: AtomicUsize,
}

impl ThreadShared {
    fn new(owner: usize) -> Self {
        let queue = WorkQueue::new();
        // The queue starts with only the owner's token in it.
        queue.push_back(QueueEntry::Token { owner });
        Self {
            queue,
            token_consumed: AtomicBool::new(false),
            scheduled_unscanned: AtomicBool::new(false),
            free_cowns: AtomicUsize::new(0),
        }
    }
}

/// Shared scheduler state. One instance per pool, behind an `Arc`.
#[derive(Debug)]
pub struct ThreadPool {
    pub(crate) config: SchedulerConfig,
    threads: Vec<Arc<ThreadShared>>,
    pub(crate) coordinator: StateCoordinator,
    pub(crate) epoch: GlobalEpoch,
    pub(crate) arena: CownArena,
    pub(crate) stats: SchedulerStats,
    running: AtomicBool,
    /// Cross-thread messages sent but not yet executed (or dropped with a
    /// collected cown).
    inflight: AtomicUsize,
    /// The subset of in-flight messages carrying the neutral epoch
    /// (external and pre-scan sends). Only these gate the believe-done
    /// vote; traffic tagged with a scan epoch is covered by the token
    /// checkpoint and the unscanned flag.
    unscanned_inflight: AtomicUsize,
    paused: AtomicUsize,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    barrier: Barrier,
    /// The scan epoch of the current (or most recent) round, for unscanned
    /// checks on the external injection path.
    round_epoch: EpochCell,
    next_external: AtomicUsize,
}

impl ThreadPool {
    pub(crate) fn new(config: SchedulerConfig) -> Arc<Self> {
        let n = config.num_workers;
        assert!(n > 0, "scheduler needs at least one worker");
        Arc::new(Self {
            threads: (0..n).map(|i| Arc::new(ThreadShared::new(i))).collect(),
            coordinator: StateCoordinator::new(n),
            epoch: GlobalEpoch::new(n),
            arena: CownArena::new(),
            stats: SchedulerStats::default(),
            running: AtomicBool::new(true),
            inflight: AtomicUsize::new(0),
            unscanned_inflight: AtomicUsize::new(0),
            paused: AtomicUsize::new(0),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            barrier: Barrier::new(n),
            round_epoch: EpochCell::new(EpochMark::EpochA),
            next_external: AtomicUsize::new(rand::random::<u32>() as usize % n),
            config,
        })
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn shared(&self, thread: usize) -> &Arc<ThreadShared> {
        &self.threads[thread]
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cooperative stop: in-flight runs finish, then threads drain and
    /// exit.
    pub(crate) fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("scheduler stop requested");
        }
        self.pause_cv.notify_all();
    }

    // ---- pause facility ------------------------------------------------

    /// Bounded pause after fruitless spinning. Interruptible by new work
    /// anywhere in the pool or by a stop request. Returns false when the
    /// pool stopped instead of pausing.
    ///
    /// The last thread to pause with nothing queued and nothing in flight
    /// detects global quiescence and stops the pool.
    pub(crate) fn pause(&self) -> bool {
        if !self.running() {
            return false;
        }
        let mut guard = self.pause_lock.lock();
        let paused_now = self.paused.fetch_add(1, Ordering::AcqRel) + 1;
        if self.config.terminate_on_quiescence
            && paused_now == self.threads.len()
            && self.no_inflight_messages()
            && self.all_queues_empty()
            && !self.coordinator.active()
        {
            self.paused.fetch_sub(1, Ordering::AcqRel);
            drop(guard);
            tracing::debug!("global quiescence detected");
            self.shutdown();
            return false;
        }
        self.pause_cv
            .wait_for(&mut guard, self.config.idle_pause);
        self.paused.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Wake paused threads. Returns true when any thread was paused.
    pub(crate) fn unpause(&self) -> bool {
        if self.paused.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.pause_cv.notify_all();
        true
    }

    // ---- in-flight accounting ------------------------------------------

    pub(crate) fn no_inflight_messages(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0
    }

    /// No neutral-epoch message is pending execution; the believe-done
    /// vote gate.
    pub(crate) fn no_unscanned_inflight(&self) -> bool {
        self.unscanned_inflight.load(Ordering::Acquire) == 0
    }

    pub(crate) fn message_executed(&self, mark: EpochMark) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        if mark == EpochMark::None {
            self.unscanned_inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Settle messages dropped without execution (collected cowns,
    /// teardown drains).
    pub(crate) fn settle(&self, msgs: Vec<Message>) {
        if msgs.is_empty() {
            return;
        }
        let neutral = msgs.iter().filter(|m| m.mark == EpochMark::None).count();
        self.inflight.fetch_sub(msgs.len(), Ordering::AcqRel);
        if neutral > 0 {
            self.unscanned_inflight.fetch_sub(neutral, Ordering::AcqRel);
        }
    }

    pub(crate) fn all_queues_empty(&self) -> bool {
        self.threads.iter().all(|t| t.queue.is_empty())
    }

    // ---- cown surfaces -------------------------------------------------

    pub(crate) fn create_cown<T: CownState>(&self, state: T, lifo: bool) -> CownRef {
        let cown = self.arena.alloc(Box::new(state), lifo);
        // Tag newborns with the current round epoch so an in-flight round
        // does not sweep them before they can be reached.
        cown.ptr().inner.mark_scanned(self.round_epoch());
        cown
    }

    /// Send a behaviour to `target`. `from` names the sending worker when
    /// the send originates inside the pool; external sends pass `None` and
    /// tag with the neutral epoch.
    pub(crate) fn send_from(
        &self,
        from: Option<usize>,
        epoch: EpochMark,
        target: &CownPtr,
        behaviour: Behaviour,
    ) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if epoch == EpochMark::None {
            self.unscanned_inflight.fetch_add(1, Ordering::AcqRel);
        }
        match target.inner.enqueue(Message {
            mark: epoch,
            behaviour,
        }) {
            Enqueue::Rejected(msg) => {
                // Messages to collected cowns are dropped.
                tracing::debug!(target = %target.id(), "dropped message to collected cown");
                self.settle(vec![msg]);
            }
            Enqueue::Queued { woke: true } => match from {
                Some(thread) => self.schedule_on(thread, target.clone(), epoch, false),
                None => self.place_external(target.clone(), false),
            },
            Enqueue::Queued { woke: false } => {}
        }
    }

    /// Push a woken cown onto `thread`'s queue, with unscanned
    /// bookkeeping against the sender's epoch.
    pub(crate) fn schedule_on(
        &self,
        thread: usize,
        ptr: CownPtr,
        send_epoch: EpochMark,
        front: bool,
    ) {
        let shared = &self.threads[thread];
        if self.coordinator.active() && !ptr.inner.scanned(send_epoch) {
            shared.scheduled_unscanned.store(true, Ordering::Release);
        }
        if front {
            shared.queue.push_front(QueueEntry::Cown(ptr));
        } else {
            shared.queue.push_back(QueueEntry::Cown(ptr));
        }
        if self.unpause() {
            self.stats.unpause();
        }
    }

    /// External injection entry point: wake `cown` and queue it FIFO on
    /// some thread. No-op while the cown is already queued or running.
    pub(crate) fn schedule_fifo(&self, ptr: &CownPtr) {
        if ptr.inner.force_wake() {
            self.place_external(ptr.clone(), false);
        }
    }

    /// External injection entry point for work that must run ahead of
    /// backlog (e.g. completed I/O): wake `cown` and queue it LIFO.
    pub(crate) fn schedule_lifo(&self, ptr: &CownPtr) {
        if ptr.inner.force_wake() {
            self.stats.lifo();
            self.place_external(ptr.clone(), true);
        }
    }

    fn place_external(&self, ptr: CownPtr, front: bool) {
        let n = self.threads.len();
        let idx = self.next_external.fetch_add(1, Ordering::AcqRel) % n;
        // External senders carry no send epoch; the popping thread scans
        // the cown if a round is in flight.
        self.schedule_on(idx, ptr, EpochMark::None, front);
    }

    // ---- leak detection ------------------------------------------------

    /// Wake every rooted cown in the arena onto `thread`'s queue, so a
    /// scan pass reaches externally held cowns that have no queued work.
    pub(crate) fn wake_rooted(&self, thread: usize) {
        for ptr in self.arena.rooted() {
            if ptr.inner.force_wake() {
                self.threads[thread]
                    .queue
                    .push_back(QueueEntry::Cown(ptr));
            }
        }
    }

    pub(crate) fn request_leak_detection(&self) {
        self.coordinator.request();
        // A fully paused pool must wake to run the round.
        if self.unpause() {
            self.stats.unpause();
        }
    }

    pub(crate) fn round_epoch(&self) -> EpochMark {
        self.round_epoch.load()
    }

    pub(crate) fn set_round_epoch(&self, epoch: EpochMark) {
        self.round_epoch.store(epoch);
    }

    /// Record a collection against the bound thread's free-cown counter.
    pub(crate) fn note_collected(&self, ptr: &CownPtr) {
        self.stats.collected();
        if let Some(thread) = ptr.inner.binding() {
            self.threads[thread].free_cowns.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Shutdown barrier between teardown phases.
    pub(crate) fn enter_barrier(&self) {
        self.barrier.wait();
    }
}
