//! Scheduler threads
//!
//! Each worker loops: observe the reclamation epoch, free stale stubs,
//! service its token, pop (or steal) an entry, and run the cown behind it.
//! The leak-detection protocol runs from the steal loop, so a thread only
//! advances the round when it has no local work.

use crossbeam::utils::Backoff;
use smallvec::{smallvec, SmallVec};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::runtime::cown::{BehaviourCtx, CownPtr};
use crate::runtime::epoch::EpochMark;
use crate::runtime::scheduler::pool::{ThreadPool, ThreadShared};
use crate::runtime::scheduler::queue::QueueEntry;
use crate::runtime::scheduler::state::ThreadState;

/// One scheduler thread's private state.
pub(crate) struct Worker {
    idx: usize,
    pool: Arc<ThreadPool>,
    shared: Arc<ThreadShared>,
    victim: usize,
    state: ThreadState,
    /// Epoch stamped on outgoing messages and used to mark scanned cowns.
    send_epoch: EpochMark,
    /// The previous round's epoch, saved across the prescan window.
    prev_epoch: EpochMark,
    /// Checkpoint passes left before this thread may vote. Two passes of
    /// the token prove the queue was fully cycled under the scan epoch.
    n_ld_tokens: u8,
    /// Armed when this thread's token came back in fair mode.
    steal_for_fairness: bool,
    /// Cowns first popped by this thread; stub reclamation runs against
    /// this list.
    owned: Vec<CownPtr>,
    /// Behaviours run since the last automatic round request.
    since_ld: usize,
}

impl Worker {
    pub(crate) fn new(idx: usize, pool: Arc<ThreadPool>) -> Self {
        let shared = Arc::clone(pool.shared(idx));
        Self {
            idx,
            shared,
            victim: idx,
            state: ThreadState::NotInLD,
            send_epoch: EpochMark::EpochA,
            prev_epoch: EpochMark::EpochB,
            n_ld_tokens: 0,
            steal_for_fairness: false,
            owned: Vec::new(),
            since_ld: 0,
            pool,
        }
    }

    pub(crate) fn run(mut self) {
        if let Some(hook) = &self.pool.config.on_thread_start {
            hook(self.idx);
        }
        tracing::debug!(thread = self.idx, "scheduler thread started");
        // A cown with backlog on an otherwise empty queue is kept in hand
        // and re-run directly; a thief cannot take it mid hand-off.
        let mut hand: Option<CownPtr> = None;
        loop {
            // A stop request wins over remaining work; queued work is
            // dropped, the in-hand batch already finished.
            if !self.pool.running() {
                break;
            }
            self.pool.epoch.observe(self.idx);
            if !self.state.blocks_stub_collection()
                && self.owned.len() < self.shared.free_cowns.load(Ordering::Acquire) * 2
            {
                self.collect_stubs();
            }
            self.check_token();
            if self.shared.queue.is_empty() {
                // Nothing queued, even if a cown is in hand: both
                // checkpoint passes hold trivially.
                self.n_ld_tokens = 0;
            }
            self.maybe_request_round();
            // A busy thread must keep answering phase queries, or a
            // requested round stalls until every queue drains.
            self.ld_protocol();

            if let Some(cown) = hand.take() {
                // Fairness still gets its one steal; the held cown then
                // yields its turn and goes back through the queue.
                if self.steal_for_fairness {
                    self.steal_for_fairness = false;
                    if let Some(entry) = self.fast_steal() {
                        self.pool
                            .schedule_on(self.idx, cown, self.send_epoch, false);
                        if let Some(stolen) = self.prerun(entry) {
                            hand = self.run_cown(stolen);
                        }
                        continue;
                    }
                }
                hand = self.run_cown(cown);
                continue;
            }

            let entry = if self.steal_for_fairness {
                self.steal_for_fairness = false;
                self.fast_steal()
            } else {
                None
            };
            let entry = entry.or_else(|| self.shared.queue.pop());
            let entry = match entry {
                Some(e) => e,
                None => match self.steal() {
                    Some(e) => e,
                    None => break,
                },
            };
            if let Some(cown) = self.prerun(entry) {
                hand = self.run_cown(cown);
            }
        }
        self.teardown();
        tracing::debug!(thread = self.idx, "scheduler thread stopped");
    }

    // ---- token protocol ------------------------------------------------

    /// Service this thread's token: when it has been consumed, count the
    /// checkpoint pass and put a fresh token at the back of the queue. The
    /// token is not re-enqueued into an empty queue; it returns once work
    /// does.
    fn check_token(&mut self) {
        if !self.shared.token_consumed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.queue.is_empty() {
            // Nothing queued: the checkpoint holds trivially.
            self.n_ld_tokens = 0;
            return;
        }
        self.shared.token_consumed.store(false, Ordering::Release);
        if self.n_ld_tokens > 0 {
            self.n_ld_tokens -= 1;
        }
        self.shared
            .queue
            .push_back(QueueEntry::Token { owner: self.idx });
        if self.pool.config.fair {
            self.steal_for_fairness = true;
        }
    }

    // ---- acquiring work ------------------------------------------------

    /// One attempt per peer, oldest work first. Entries (including stolen
    /// tokens) go through [`prerun`](Self::prerun) like any pop.
    fn fast_steal(&mut self) -> Option<QueueEntry> {
        let n = self.pool.num_threads();
        for offset in 1..n {
            let victim = (self.idx + offset) % n;
            if let Some(entry) = self.pool.shared(victim).queue.pop() {
                if !entry.is_token() {
                    self.pool.stats.steal();
                }
                return Some(entry);
            }
        }
        None
    }

    fn next_victim(&mut self) -> usize {
        let n = self.pool.num_threads();
        self.victim = (self.victim + 1) % n;
        if self.victim == self.idx {
            self.victim = (self.victim + 1) % n;
        }
        self.victim
    }

    /// Out of local work: interleave the leak-detection protocol with
    /// steal attempts, backing off into a bounded pause when everything
    /// stays empty. Returns `None` only when the pool stopped.
    fn steal(&mut self) -> Option<QueueEntry> {
        let backoff = Backoff::new();
        while self.pool.running() {
            self.check_token();
            if self.shared.queue.is_empty() {
                // Both checkpoint passes are trivially done.
                self.n_ld_tokens = 0;
            }
            self.ld_protocol();

            if let Some(entry) = self.shared.queue.pop() {
                return Some(entry);
            }
            let victim = self.next_victim();
            if victim != self.idx {
                if let Some(entry) = self.pool.shared(victim).queue.pop() {
                    if !entry.is_token() {
                        self.pool.stats.steal();
                    }
                    return Some(entry);
                }
            }

            if backoff.is_completed() {
                if self.state == ThreadState::NotInLD && self.shared.queue.is_empty() {
                    self.pool.stats.pause();
                    if !self.pool.pause() {
                        return None;
                    }
                    backoff.reset();
                } else {
                    // Mid-round threads stay responsive to the protocol.
                    std::thread::yield_now();
                }
            } else {
                backoff.snooze();
            }
        }
        None
    }

    /// Handle a popped entry. Tokens mark their owner's checkpoint and
    /// yield no work; cowns get bound, stamped with the pop epoch, and
    /// returned for running.
    fn prerun(&mut self, entry: QueueEntry) -> Option<CownPtr> {
        match entry {
            QueueEntry::Token { owner } => {
                let prev = self
                    .pool
                    .shared(owner)
                    .token_consumed
                    .swap(true, Ordering::AcqRel);
                assert!(!prev, "thread {owner}'s token was consumed twice");
                None
            }
            QueueEntry::Cown(cown) => {
                if cown.inner.bind(self.idx) {
                    self.owned.push(cown.clone());
                }
                cown.inner.note_popped(self.pool.epoch.current());
                Some(cown)
            }
        }
    }

    // ---- running a cown ------------------------------------------------

    /// Run one batch. Returns the cown when it still has backlog and the
    /// local queue is empty, to be re-run without a queue round trip.
    fn run_cown(&mut self, cown: CownPtr) -> Option<CownPtr> {
        if cown.inner.is_collected() {
            return None;
        }
        if self.state.in_scan_window() {
            self.scan_cown(&cown, self.send_epoch);
        } else if self.state == ThreadState::PreScan {
            // The scan epoch is already determined; marking now saves the
            // cown a rescan once the scan proper starts.
            self.scan_cown(&cown, self.prev_epoch.next());
        }

        let mut held = cown.inner.take_state();
        let batch = cown.inner.take_batch(self.pool.config.batch_limit);
        let executed = batch.len();
        for msg in batch {
            let mark = msg.mark;
            let mut ctx = BehaviourCtx {
                pool: &self.pool,
                thread: self.idx,
                send_epoch: self.send_epoch,
                cown: &cown,
                state: &mut held,
            };
            (msg.behaviour)(&mut ctx);
            self.pool.message_executed(mark);
        }
        cown.inner.restore_state(held);
        if executed > 0 {
            self.pool.stats.batch(executed);
            self.since_ld += executed;
        }

        if cown.inner.finish_batch() {
            if self.shared.queue.is_empty() {
                return Some(cown);
            }
            // More queued than the batch limit; back of the line.
            self.pool
                .schedule_on(self.idx, cown, self.send_epoch, false);
        } else {
            self.try_release(&cown);
        }
        None
    }

    /// Direct (acyclic) reclaim of a cown that just went to sleep: no
    /// rooted handle, and no `CownPtr` alive beyond the bookkeeping ones
    /// (arena slot, ownership list, this runner, one per weak handle).
    /// Anything else still referencing it keeps it for leak detection to
    /// judge.
    fn try_release(&mut self, cown: &CownPtr) {
        if cown.inner.is_rooted() {
            return;
        }
        let bookkeeping = 3 + cown.inner.weak_count();
        if Arc::strong_count(&cown.inner) > bookkeeping {
            return;
        }
        if let Some(msgs) = cown.inner.release_if_unrooted() {
            self.pool.settle(msgs);
            self.pool.note_collected(cown);
            tracing::trace!(cown = %cown.id(), "collected unreferenced cown");
        }
    }

    /// Transitively mark everything reachable from `root` as scanned in
    /// `epoch`.
    fn scan_cown(&mut self, root: &CownPtr, epoch: EpochMark) {
        if root.inner.scanned(epoch) {
            return;
        }
        let mut stack: SmallVec<[CownPtr; 16]> = smallvec![root.clone()];
        while let Some(cown) = stack.pop() {
            if cown.inner.scanned(epoch) {
                continue;
            }
            cown.inner.mark_scanned(epoch);
            cown.inner.trace_into(&mut |child| {
                if !child.inner.scanned(epoch) {
                    stack.push(child.clone());
                }
            });
        }
    }

    // ---- leak detection ------------------------------------------------

    fn maybe_request_round(&mut self) {
        let Some(threshold) = self.pool.config.ld_threshold else {
            return;
        };
        if self.state == ThreadState::NotInLD && self.since_ld >= threshold {
            self.since_ld = 0;
            self.state = ThreadState::WantLD;
            self.pool.coordinator.commit(self.idx, ThreadState::WantLD);
            tracing::debug!(thread = self.idx, "requesting leak-detection round");
        }
    }

    /// Play catch-up with the global phase, applying the local side effect
    /// of every transition taken.
    fn ld_protocol(&mut self) {
        // An AllInScan thread whose checkpoint has passed either votes or,
        // if neutral-epoch messages are still circulating, restarts its
        // scan. Traffic already carrying the scan epoch never blocks the
        // vote; an unscanned target trips the scheduled_unscanned flag
        // instead.
        if self.state == ThreadState::AllInScan && self.n_ld_tokens == 0 {
            if !self.shared.scheduled_unscanned.load(Ordering::Acquire)
                && self.pool.no_unscanned_inflight()
            {
                self.state = ThreadState::BelieveDoneVote;
                self.pool
                    .coordinator
                    .commit(self.idx, ThreadState::BelieveDoneVote);
            } else {
                self.enter_scan();
            }
        }

        loop {
            let next = self.pool.coordinator.next_state(self.idx, self.state);
            if next == self.state {
                return;
            }
            let sprev = self.state;
            self.state = next;
            tracing::trace!(thread = self.idx, from = %sprev, to = %next, "phase transition");
            match next {
                ThreadState::PreScan => {
                    // Paused peers must wake to join the round.
                    if self.pool.unpause() {
                        self.pool.stats.unpause();
                    }
                    self.enter_prescan();
                    return;
                }
                ThreadState::Scan => {
                    // Rejoining the scan from a retracted vote skips the
                    // prescan window; a fresh entry does not.
                    if sprev == ThreadState::PreScan {
                        self.enter_scan();
                        return;
                    }
                    if sprev == ThreadState::NotInLD || sprev == ThreadState::WantLD {
                        self.enter_prescan();
                    }
                    self.enter_scan();
                }
                ThreadState::AllInScan => return,
                ThreadState::BelieveDone => {
                    // All votes are in; resolve ours immediately.
                    let vote = if self.shared.scheduled_unscanned.load(Ordering::Acquire) {
                        ThreadState::BelieveDoneRetract
                    } else {
                        ThreadState::BelieveDoneConfirm
                    };
                    self.state = vote;
                    self.pool.coordinator.commit(self.idx, vote);
                }
                ThreadState::Sweep => {
                    self.sweep();
                }
                ThreadState::NotInLD => {
                    // Round complete for this thread.
                    self.pool.epoch.advance();
                    return;
                }
                _ => {}
            }
        }
    }

    fn enter_prescan(&mut self) {
        self.prev_epoch = self.send_epoch;
        self.send_epoch = EpochMark::None;
    }

    fn enter_scan(&mut self) {
        self.send_epoch = self.prev_epoch.next();
        self.pool.set_round_epoch(self.send_epoch);
        self.shared.scheduled_unscanned.store(false, Ordering::Release);
        self.n_ld_tokens = 2;
        // Cowns reachable from outside the pool must be visited this round
        // even with no organic work: every rooted cown in the arena, plus
        // owned cowns eligible for external injection. Waking is
        // exclusive, so threads entering scan concurrently never queue a
        // cown twice.
        self.pool.wake_rooted(self.idx);
        for cown in &self.owned {
            if cown.inner.can_lifo_schedule() && cown.inner.force_wake() {
                self.shared.queue.push_back(QueueEntry::Cown(cown.clone()));
            }
        }
        tracing::trace!(thread = self.idx, epoch = %self.send_epoch, "entering scan");
    }

    /// Collect every owned cown the round did not reach.
    fn sweep(&mut self) {
        let epoch = self.send_epoch;
        let mut freed = 0usize;
        for cown in &self.owned {
            if let Some(msgs) = cown.inner.try_collect(epoch) {
                self.pool.settle(msgs);
                self.pool.stats.collected();
                freed += 1;
            }
        }
        if freed > 0 {
            self.shared.free_cowns.fetch_add(freed, Ordering::AcqRel);
            tracing::debug!(thread = self.idx, freed, "swept unreachable cowns");
        }
    }

    // ---- stub reclamation ----------------------------------------------

    /// Free the stubs of collected cowns: no weak handle left to service,
    /// and a pop epoch every thread has moved past. Triggered when
    /// collected cowns dominate the ownership list.
    fn collect_stubs(&mut self) {
        let owned = std::mem::take(&mut self.owned);
        let mut freed = 0usize;
        for cown in owned {
            if cown.inner.is_collected()
                && cown.inner.weak_count() == 0
                && self.pool.epoch.is_outdated(cown.inner.popped_epoch())
            {
                self.pool.arena.release(cown.id());
                self.pool.stats.stub_freed();
                freed += 1;
            } else {
                self.owned.push(cown);
            }
        }
        if freed > 0 {
            self.shared.free_cowns.fetch_sub(freed, Ordering::AcqRel);
            tracing::trace!(thread = self.idx, freed, "freed stale cown stubs");
        }
    }

    // ---- shutdown ------------------------------------------------------

    fn teardown(&mut self) {
        // Collect everything this thread owns, then synchronise so no peer
        // still observes an old epoch before the stubs go.
        let owned = std::mem::take(&mut self.owned);
        for cown in &owned {
            if let Some(msgs) = cown.inner.collect() {
                self.pool.settle(msgs);
            }
        }
        self.pool.enter_barrier();
        if self.idx == 0 {
            self.pool.epoch.advance();
        }
        self.pool.enter_barrier();
        self.pool.epoch.observe(self.idx);

        for cown in owned {
            self.pool.arena.release(cown.id());
            self.pool.stats.stub_freed();
        }
        for entry in self.shared.queue.drain() {
            if let QueueEntry::Cown(cown) = entry {
                if let Some(msgs) = cown.inner.collect() {
                    self.pool.settle(msgs);
                }
            }
        }
    }
}
