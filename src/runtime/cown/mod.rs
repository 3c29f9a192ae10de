//! Cowns: concurrently-owned schedulable objects
//!
//! A cown owns a message queue and some behaviour state. At most one thread
//! runs a cown at any instant; the scheduler guarantees this by only running
//! a cown the thread has popped from a work queue, and a sleeping cown is
//! scheduled by exactly the sender whose message woke it.
//!
//! Three handle types exist:
//!
//! - [`CownRef`]: rooted strong handle held by embedders. A rooted cown is
//!   never reclaimed by a leak-detection round.
//! - [`CownPtr`]: unrooted handle stored inside cown state and reported by
//!   [`CownState::trace`]. It keeps the allocation alive but does not root
//!   it, so cycles of `CownPtr`s are reclaimable.
//! - [`CownWeak`]: weak handle serviced by the residual stub after the cown
//!   has been collected.

pub mod arena;

use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::epoch::{EpochCell, EpochMark, NO_EPOCH};
use crate::runtime::scheduler::pool::ThreadPool;

pub use arena::{CownArena, CownId};

/// Sentinel for "not yet bound to a scheduler thread".
const UNBOUND: usize = usize::MAX;

/// Behaviour state stored in a cown.
///
/// `trace` reports every [`CownPtr`] the state holds; the scan phase of a
/// leak-detection round uses it to reach cowns through reference cycles.
/// States that hold no cown references keep the empty default.
pub trait CownState: Send + 'static {
    fn trace(&self, _mark: &mut dyn FnMut(&CownPtr)) {}
}

impl CownState for () {}
impl CownState for usize {}

/// Object-safe shim over [`CownState`] adding downcasting.
pub(crate) trait AnyState: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn trace_refs(&self, mark: &mut dyn FnMut(&CownPtr));
}

impl<T: CownState> AnyState for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn trace_refs(&self, mark: &mut dyn FnMut(&CownPtr)) {
        self.trace(mark);
    }
}

/// A queued behaviour.
pub(crate) type Behaviour = Box<dyn FnOnce(&mut BehaviourCtx<'_>) + Send>;

/// A message: a behaviour tagged with the sender's send epoch.
pub(crate) struct Message {
    pub(crate) mark: EpochMark,
    pub(crate) behaviour: Behaviour,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").field("mark", &self.mark).finish()
    }
}

/// Outcome of [`Cown::enqueue`].
#[derive(Debug)]
pub(crate) enum Enqueue {
    /// The cown was collected before the message landed; the caller gets
    /// it back to settle accounting.
    Rejected(Message),
    /// Queued. When `woke` is true the caller holds the exclusive right
    /// to schedule the cown.
    Queued { woke: bool },
}

#[derive(Debug)]
struct MsgQueue {
    msgs: VecDeque<Message>,
    /// True while the cown is neither queued nor running. The transition
    /// sleeping -> awake hands the exclusive right to schedule the cown to
    /// whoever made it.
    sleeping: bool,
}

/// The cown record. Reached through [`CownPtr`]; not constructed directly.
pub struct Cown {
    id: CownId,
    msgs: Mutex<MsgQueue>,
    /// `None` once collected, or transiently while the runner holds the
    /// state out of the cell. Also serialises collect vs. rooting.
    state: Mutex<Option<Box<dyn AnyState>>>,
    /// Last-scanned send epoch.
    mark: EpochCell,
    roots: AtomicUsize,
    weaks: AtomicUsize,
    /// Scheduler thread this cown is bound to; set once at first dequeue.
    bound_to: AtomicUsize,
    /// Reclamation epoch at the most recent pop, for stub safety.
    epoch_when_popped: AtomicU64,
    collected: AtomicBool,
    /// Eligible for externally triggered (LIFO) execution.
    lifo_schedulable: bool,
}

impl Cown {
    pub(crate) fn new(id: CownId, state: Box<dyn AnyState>, lifo_schedulable: bool) -> Self {
        Self {
            id,
            msgs: Mutex::new(MsgQueue {
                msgs: VecDeque::new(),
                sleeping: true,
            }),
            state: Mutex::new(Some(state)),
            mark: EpochCell::default(),
            roots: AtomicUsize::new(0),
            weaks: AtomicUsize::new(0),
            bound_to: AtomicUsize::new(UNBOUND),
            epoch_when_popped: AtomicU64::new(NO_EPOCH),
            collected: AtomicBool::new(false),
            lifo_schedulable,
        }
    }

    pub(crate) fn id(&self) -> CownId {
        self.id
    }

    /// Append a message. The collected check happens under the message
    /// lock: collection sets the flag before draining, so an enqueue either
    /// lands before the drain (and is drained) or observes the flag.
    pub(crate) fn enqueue(&self, msg: Message) -> Enqueue {
        let mut q = self.msgs.lock();
        if self.is_collected() {
            return Enqueue::Rejected(msg);
        }
        q.msgs.push_back(msg);
        if q.sleeping {
            q.sleeping = false;
            Enqueue::Queued { woke: true }
        } else {
            Enqueue::Queued { woke: false }
        }
    }

    /// Wake a sleeping cown with no message, so a scan round visits it.
    /// Returns true when the caller acquired the right to schedule it.
    pub(crate) fn force_wake(&self) -> bool {
        let mut q = self.msgs.lock();
        if self.is_collected() {
            return false;
        }
        if q.sleeping {
            q.sleeping = false;
            true
        } else {
            false
        }
    }

    /// Pop up to `limit` messages for the current batch. Does not touch the
    /// sleeping flag; only [`finish_batch`](Self::finish_batch) may put the
    /// cown back to sleep.
    pub(crate) fn take_batch(&self, limit: usize) -> Vec<Message> {
        let mut q = self.msgs.lock();
        let n = q.msgs.len().min(limit);
        q.msgs.drain(..n).collect()
    }

    /// After a batch: report whether work remains, atomically falling
    /// asleep when it does not.
    pub(crate) fn finish_batch(&self) -> bool {
        let mut q = self.msgs.lock();
        if q.msgs.is_empty() {
            q.sleeping = true;
            false
        } else {
            true
        }
    }

    /// Reached during the round identified by `epoch`. The neutral mark
    /// carries no round constraint and always counts as scanned.
    pub(crate) fn scanned(&self, epoch: EpochMark) -> bool {
        epoch == EpochMark::None || self.mark.load() == epoch
    }

    pub(crate) fn mark_scanned(&self, epoch: EpochMark) {
        self.mark.store(epoch);
    }

    /// Report the `CownPtr`s this cown's state reaches. Silently skips when
    /// the state is held out by a concurrent runner; that runner performs
    /// the scan itself.
    pub(crate) fn trace_into(&self, mark: &mut dyn FnMut(&CownPtr)) {
        let state = self.state.lock();
        if let Some(s) = state.as_ref() {
            s.trace_refs(mark);
        }
    }

    /// Take the state out for a batch run. The running thread holds it
    /// until [`restore_state`](Self::restore_state).
    pub(crate) fn take_state(&self) -> Option<Box<dyn AnyState>> {
        self.state.lock().take()
    }

    /// Hand the state back after a batch. A cown collected mid-run keeps
    /// its state dropped.
    pub(crate) fn restore_state(&self, state: Option<Box<dyn AnyState>>) {
        let mut guard = self.state.lock();
        if !self.is_collected() {
            *guard = state;
        }
    }

    fn collect_with(
        &self,
        mut state: MutexGuard<'_, Option<Box<dyn AnyState>>>,
    ) -> Option<Vec<Message>> {
        if self.collected.swap(true, Ordering::AcqRel) {
            return None;
        }
        // Dropping the state here is what breaks CownPtr cycles.
        *state = None;
        drop(state);
        let mut q = self.msgs.lock();
        Some(q.msgs.drain(..).collect())
    }

    /// Collect the cown: drop behaviour state (breaking any `CownPtr`
    /// cycles it holds) and drain pending messages. Returns the drained
    /// messages so the caller can settle the in-flight count; `None` when
    /// already collected.
    pub(crate) fn collect(&self) -> Option<Vec<Message>> {
        self.collect_with(self.state.lock())
    }

    /// Reference-count reclaim: collect iff no rooted handle exists. The
    /// roots check and the collect happen under the state lock, so a
    /// concurrent `CownPtr::root` either completes first (and blocks the
    /// collect) or observes the cown as collected.
    pub(crate) fn release_if_unrooted(&self) -> Option<Vec<Message>> {
        let state = self.state.lock();
        if self.roots.load(Ordering::Acquire) > 0 {
            return None;
        }
        self.collect_with(state)
    }

    /// Sweep-phase self-collection: collect iff this cown was not reached
    /// during the round identified by `round_epoch`.
    pub(crate) fn try_collect(&self, round_epoch: EpochMark) -> Option<Vec<Message>> {
        if self.is_collected() || self.scanned(round_epoch) {
            return None;
        }
        self.collect()
    }

    pub(crate) fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    /// First-touch bind to a scheduler thread. Returns true when this call
    /// performed the binding.
    pub(crate) fn bind(&self, thread: usize) -> bool {
        self.bound_to
            .compare_exchange(UNBOUND, thread, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn binding(&self) -> Option<usize> {
        match self.bound_to.load(Ordering::Acquire) {
            UNBOUND => None,
            t => Some(t),
        }
    }

    pub(crate) fn note_popped(&self, epoch: u64) {
        self.epoch_when_popped.store(epoch, Ordering::Release);
    }

    pub(crate) fn popped_epoch(&self) -> u64 {
        self.epoch_when_popped.load(Ordering::Acquire)
    }

    pub(crate) fn root_count(&self) -> usize {
        self.roots.load(Ordering::Acquire)
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.weaks.load(Ordering::Acquire)
    }

    pub(crate) fn can_lifo_schedule(&self) -> bool {
        self.lifo_schedulable && !self.is_collected()
    }

    pub(crate) fn is_rooted(&self) -> bool {
        self.root_count() > 0 && !self.is_collected()
    }
}

impl fmt::Debug for Cown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cown")
            .field("id", &self.id)
            .field("mark", &self.mark)
            .field("collected", &self.is_collected())
            .finish()
    }
}

/// Unrooted cown handle.
///
/// Cheap to clone; keeps the allocation alive for memory safety but does
/// not protect the cown from leak detection. Store these inside cown state
/// and report them from [`CownState::trace`].
#[derive(Clone)]
pub struct CownPtr {
    pub(crate) inner: Arc<Cown>,
}

impl CownPtr {
    pub fn id(&self) -> CownId {
        self.inner.id()
    }

    /// Root this cown, yielding a strong handle. Fails once the cown has
    /// been collected.
    pub fn root(&self) -> Option<CownRef> {
        let _state = self.inner.state.lock();
        if self.inner.is_collected() {
            return None;
        }
        self.inner.roots.fetch_add(1, Ordering::AcqRel);
        Some(CownRef { ptr: self.clone() })
    }

    /// Take a weak handle serviced by the cown's stub.
    pub fn downgrade(&self) -> CownWeak {
        self.inner.weaks.fetch_add(1, Ordering::AcqRel);
        CownWeak { ptr: self.clone() }
    }

    /// Whether the cown's behaviour state has been reclaimed.
    pub fn is_collected(&self) -> bool {
        self.inner.is_collected()
    }

    pub fn same_cown(&self, other: &CownPtr) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CownPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CownPtr({:?})", self.id())
    }
}

/// Rooted strong handle held by embedders.
pub struct CownRef {
    ptr: CownPtr,
}

impl CownRef {
    pub fn ptr(&self) -> &CownPtr {
        &self.ptr
    }

    pub fn id(&self) -> CownId {
        self.ptr.id()
    }

    pub fn downgrade(&self) -> CownWeak {
        self.ptr.downgrade()
    }
}

impl Clone for CownRef {
    fn clone(&self) -> Self {
        self.ptr.inner.roots.fetch_add(1, Ordering::AcqRel);
        Self {
            ptr: self.ptr.clone(),
        }
    }
}

impl Drop for CownRef {
    fn drop(&mut self) {
        self.ptr.inner.roots.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CownRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CownRef({:?})", self.id())
    }
}

/// Weak cown handle.
///
/// Keeps only the residual stub alive. `upgrade` succeeds while the cown is
/// uncollected.
pub struct CownWeak {
    ptr: CownPtr,
}

impl CownWeak {
    pub fn upgrade(&self) -> Option<CownRef> {
        self.ptr.root()
    }

    pub fn id(&self) -> CownId {
        self.ptr.id()
    }
}

impl Clone for CownWeak {
    fn clone(&self) -> Self {
        self.ptr.inner.weaks.fetch_add(1, Ordering::AcqRel);
        Self {
            ptr: self.ptr.clone(),
        }
    }
}

impl Drop for CownWeak {
    fn drop(&mut self) {
        self.ptr.inner.weaks.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CownWeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CownWeak({:?})", self.id())
    }
}

/// Execution context handed to a running behaviour.
///
/// Grants access to the cown's state and to the scheduler surfaces a
/// behaviour may use: sending messages, creating cowns, requesting a
/// leak-detection round.
pub struct BehaviourCtx<'a> {
    pub(crate) pool: &'a Arc<ThreadPool>,
    pub(crate) thread: usize,
    pub(crate) send_epoch: EpochMark,
    pub(crate) cown: &'a CownPtr,
    pub(crate) state: &'a mut Option<Box<dyn AnyState>>,
}

impl BehaviourCtx<'_> {
    /// The state of the cown this behaviour runs against.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not the state type the cown was created with, or
    /// when the cown has been collected out from under a queued behaviour;
    /// both are unrecoverable invariant violations.
    pub fn state<T: CownState>(&mut self) -> &mut T {
        self.state
            .as_mut()
            .expect("behaviour ran against a collected cown")
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("cown state type mismatch")
    }

    /// The cown this behaviour runs against.
    pub fn cown(&self) -> &CownPtr {
        self.cown
    }

    /// Send a behaviour to `target`, tagged with this thread's send epoch.
    pub fn send<F>(&self, target: &CownPtr, behaviour: F)
    where
        F: FnOnce(&mut BehaviourCtx<'_>) + Send + 'static,
    {
        self.pool.send_from(
            Some(self.thread),
            self.send_epoch,
            target,
            Box::new(behaviour),
        );
    }

    /// Create a new cown.
    pub fn create<T: CownState>(&self, state: T) -> CownRef {
        self.pool.create_cown(state, false)
    }

    /// Create a cown eligible for externally triggered (LIFO) execution.
    pub fn create_lifo<T: CownState>(&self, state: T) -> CownRef {
        self.pool.create_cown(state, true)
    }

    /// Ask the pool for a leak-detection round.
    pub fn request_leak_detection(&self) {
        self.pool.request_leak_detection();
    }
}

#[cfg(test)]
mod tests;
