//! Leak-detection protocol states
//!
//! Each scheduler thread runs the round
//! `NotInLD -> WantLD -> PreScan -> Scan -> AllInScan -> BelieveDoneVote ->
//! {BelieveDoneRetract | BelieveDoneConfirm} -> ReallyDoneConfirm -> Sweep ->
//! Finished -> NotInLD` against the shared [`StateCoordinator`]. Threads
//! only issue queries and proposals; the coordinator is the single owner of
//! the global phase and plays every barrier by counting the registered
//! per-thread states.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Per-thread phase in the leak-detection round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NotInLD,
    WantLD,
    PreScan,
    Scan,
    AllInScan,
    /// Voted "I believe scanning is done"; waiting for the other votes.
    BelieveDoneVote,
    /// All votes are in; the thread must immediately resolve to retract or
    /// confirm. Transitional: never registered as a resting state.
    BelieveDone,
    BelieveDoneRetract,
    BelieveDoneConfirm,
    ReallyDoneConfirm,
    Sweep,
    Finished,
}

impl ThreadState {
    /// Position within the round, for barrier predicates. Retract and
    /// confirm share a rank: both mean "voted and resolved".
    fn rank(self) -> u8 {
        match self {
            ThreadState::NotInLD | ThreadState::WantLD => 0,
            ThreadState::PreScan => 1,
            ThreadState::Scan => 2,
            ThreadState::AllInScan => 3,
            ThreadState::BelieveDoneVote | ThreadState::BelieveDone => 4,
            ThreadState::BelieveDoneRetract | ThreadState::BelieveDoneConfirm => 5,
            ThreadState::ReallyDoneConfirm => 6,
            ThreadState::Sweep => 7,
            ThreadState::Finished => 8,
        }
    }

    /// States bracketing global sweep confirmation, during which stub
    /// collection must not run.
    pub fn blocks_stub_collection(self) -> bool {
        matches!(self, ThreadState::ReallyDoneConfirm | ThreadState::Finished)
    }

    /// Whether a thread in this state is inside the scan window and must
    /// track unscanned cowns.
    pub fn in_scan_window(self) -> bool {
        matches!(
            self,
            ThreadState::Scan
                | ThreadState::AllInScan
                | ThreadState::BelieveDoneVote
                | ThreadState::BelieveDone
                | ThreadState::BelieveDoneRetract
                | ThreadState::BelieveDoneConfirm
        )
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadState::NotInLD => "NotInLD",
            ThreadState::WantLD => "WantLD",
            ThreadState::PreScan => "PreScan",
            ThreadState::Scan => "Scan",
            ThreadState::AllInScan => "AllInScan",
            ThreadState::BelieveDoneVote => "BelieveDone_Vote",
            ThreadState::BelieveDone => "BelieveDone",
            ThreadState::BelieveDoneRetract => "BelieveDone_Retract",
            ThreadState::BelieveDoneConfirm => "BelieveDone_Confirm",
            ThreadState::ReallyDoneConfirm => "ReallyDone_Confirm",
            ThreadState::Sweep => "Sweep",
            ThreadState::Finished => "Finished",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
struct CoordInner {
    states: Vec<ThreadState>,
    /// A round has been asked for; consumed once every thread has entered
    /// the round.
    requested: bool,
    /// Some thread retracted its vote; sticky until every thread has left
    /// the voting band.
    retracted: bool,
}

/// Single owner of the global leak-detection phase.
///
/// Threads call [`next_state`](Self::next_state) to play catch-up with the
/// global phase and [`commit`](Self::commit) for locally driven transitions
/// (requesting a round, voting, resolving a vote). The fast path for idle
/// threads is a single atomic load.
#[derive(Debug)]
pub struct StateCoordinator {
    inner: Mutex<CoordInner>,
    /// Any round in progress or requested. Lock-free fast path.
    active: AtomicBool,
    /// Completed rounds.
    rounds: AtomicU64,
}

impl StateCoordinator {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "coordinator needs at least one thread");
        Self {
            inner: Mutex::new(CoordInner {
                states: vec![ThreadState::NotInLD; num_threads],
                requested: false,
                retracted: false,
            }),
            active: AtomicBool::new(false),
            rounds: AtomicU64::new(0),
        }
    }

    /// Ask for a leak-detection round. Idempotent; a request landing while
    /// a round is already in flight is covered by that round.
    pub fn request(&self) {
        let mut inner = self.inner.lock();
        inner.requested = true;
        self.active.store(true, Ordering::Release);
    }

    /// Whether any round is requested or in flight.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Completed round count.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Acquire)
    }

    /// Register a locally driven transition (WantLD, the vote, and its
    /// resolution).
    pub fn commit(&self, thread: usize, state: ThreadState) {
        let mut inner = self.inner.lock();
        inner.states[thread] = state;
        if state == ThreadState::WantLD {
            inner.requested = true;
            self.active.store(true, Ordering::Release);
        }
        if state == ThreadState::BelieveDoneRetract {
            inner.retracted = true;
        }
    }

    /// Given the thread's current state, what should it become? Commits the
    /// answer when it differs. This is the only place global phase
    /// progression happens, driven purely by the registered states.
    pub fn next_state(&self, thread: usize, current: ThreadState) -> ThreadState {
        // Idle threads outside any round take the lock-free path.
        if current == ThreadState::NotInLD && !self.active() {
            return ThreadState::NotInLD;
        }

        let mut inner = self.inner.lock();
        let next = Self::step(&inner, current);
        if next != current {
            inner.states[thread] = next;
            self.after_commit(&mut inner);
        }
        next
    }

    fn step(inner: &CoordInner, current: ThreadState) -> ThreadState {
        let all = |min_rank: u8| inner.states.iter().all(|s| s.rank() >= min_rank);

        match current {
            ThreadState::NotInLD | ThreadState::WantLD => {
                // Join only a round that is starting (peers in the entry
                // band). A peer winding down through Sweep/Finished is in
                // the previous round; chasing it, or honouring a request
                // before that round has fully closed, would wedge it.
                let entering = inner.states.iter().any(|s| matches!(s.rank(), 1..=3));
                let winding_down = inner.states.iter().any(|s| s.rank() >= 4);
                if entering || (inner.requested && !winding_down) {
                    ThreadState::PreScan
                } else {
                    ThreadState::NotInLD
                }
            }
            ThreadState::PreScan => {
                if all(1) {
                    ThreadState::Scan
                } else {
                    ThreadState::PreScan
                }
            }
            ThreadState::Scan => {
                if !inner.retracted && all(2) {
                    ThreadState::AllInScan
                } else {
                    ThreadState::Scan
                }
            }
            // The vote out of AllInScan is proposed locally via `commit`.
            ThreadState::AllInScan => ThreadState::AllInScan,
            ThreadState::BelieveDoneVote => {
                if inner.retracted {
                    ThreadState::Scan
                } else if all(4) {
                    ThreadState::BelieveDone
                } else {
                    ThreadState::BelieveDoneVote
                }
            }
            // Transitional; resolved by the thread itself.
            ThreadState::BelieveDone => ThreadState::BelieveDone,
            ThreadState::BelieveDoneRetract => ThreadState::Scan,
            ThreadState::BelieveDoneConfirm => {
                // Rank band, not equality: threads already past confirm
                // must still count, or the first one through strands the
                // rest. A pending retract holds everyone back instead.
                if inner.retracted {
                    ThreadState::Scan
                } else if all(5) {
                    ThreadState::ReallyDoneConfirm
                } else {
                    ThreadState::BelieveDoneConfirm
                }
            }
            ThreadState::ReallyDoneConfirm => {
                if all(6) {
                    ThreadState::Sweep
                } else {
                    ThreadState::ReallyDoneConfirm
                }
            }
            ThreadState::Sweep => ThreadState::Finished,
            ThreadState::Finished => {
                if inner
                    .states
                    .iter()
                    .all(|s| matches!(s, ThreadState::Finished | ThreadState::NotInLD))
                {
                    ThreadState::NotInLD
                } else {
                    ThreadState::Finished
                }
            }
        }
    }

    fn after_commit(&self, inner: &mut CoordInner) {
        // The request is consumed once every thread has entered the round.
        // Leaving it set would bounce an early finisher straight into a
        // second round while peers are still winding down.
        if inner.requested && inner.states.iter().all(|s| s.rank() >= 1) {
            inner.requested = false;
        }

        // A retract is acknowledged once no thread remains in the voting
        // band; the next scan pass then starts clean.
        if inner.retracted
            && !inner.states.iter().any(|s| matches!(s.rank(), 4 | 5))
        {
            inner.retracted = false;
        }

        // The last thread back to NotInLD ends the round.
        if inner
            .states
            .iter()
            .all(|s| *s == ThreadState::NotInLD)
            && self.active()
        {
            inner.requested = false;
            inner.retracted = false;
            self.active.store(false, Ordering::Release);
            self.rounds.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(round = self.rounds(), "leak-detection round complete");
        }
    }
}
