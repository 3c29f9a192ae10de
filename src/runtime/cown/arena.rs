//! Cown arena
//!
//! The allocator collaborator: every cown is allocated through the arena,
//! which retains the primary reference for the cown's lifetime. Releasing a
//! slot frees the residual stub; any outstanding handles keep the backing
//! allocation alive, so a release is always memory safe.
//!
//! Slots are addressed by stable [`CownId`]s rather than raw pointers, and
//! per-thread ownership is recorded as (thread, id) bindings on the cown
//! itself.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{AnyState, Cown, CownPtr, CownRef};

/// Stable cown identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CownId(pub(crate) u64);

impl fmt::Display for CownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cown#{}", self.0)
    }
}

/// Slot map holding the primary reference of every live cown and stub.
#[derive(Debug, Default)]
pub struct CownArena {
    slots: Mutex<HashMap<CownId, CownPtr>>,
    next_id: AtomicU64,
}

impl CownArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a cown, returning a rooted handle.
    pub(crate) fn alloc(
        &self,
        state: Box<dyn AnyState>,
        lifo_schedulable: bool,
    ) -> CownRef {
        let id = CownId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ptr = CownPtr {
            inner: Arc::new(Cown::new(id, state, lifo_schedulable)),
        };
        ptr.inner.roots.fetch_add(1, Ordering::AcqRel);
        self.slots.lock().insert(id, ptr.clone());
        tracing::trace!(%id, "allocated cown");
        CownRef { ptr }
    }

    /// Release a slot, freeing the stub. Idempotent.
    pub(crate) fn release(&self, id: CownId) {
        if self.slots.lock().remove(&id).is_some() {
            tracing::trace!(%id, "released cown stub");
        }
    }

    /// Snapshot of every rooted, uncollected cown. Used to seed a scan
    /// round with the externally reachable set.
    pub(crate) fn rooted(&self) -> Vec<CownPtr> {
        self.slots
            .lock()
            .values()
            .filter(|p| p.inner.is_rooted() && !p.inner.is_collected())
            .cloned()
            .collect()
    }

    /// Number of live slots (cowns plus stubs).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown: hand back every residual slot so the pool can settle
    /// in-flight accounting and drop them.
    pub(crate) fn drain(&self) -> Vec<CownPtr> {
        self.slots.lock().drain().map(|(_, p)| p).collect()
    }
}
