//! Scheduler statistics
//!
//! Informational counters only; never part of the functional contract.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Pool-wide scheduling and collection counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Message batches executed.
    pub batches_run: AtomicUsize,
    /// Behaviours executed.
    pub behaviours_run: AtomicUsize,
    /// Successful steals.
    pub steals: AtomicUsize,
    /// LIFO (externally triggered) injections.
    pub lifo_scheduled: AtomicUsize,
    /// Times a thread entered the bounded pause.
    pub pauses: AtomicUsize,
    /// Times a pause was interrupted by new work.
    pub unpauses: AtomicUsize,
    /// Cowns collected (state reclaimed), by any path.
    pub cowns_collected: AtomicUsize,
    /// Residual stubs freed after their epoch went stale.
    pub stubs_freed: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    pub fn batch(&self, behaviours: usize) {
        self.batches_run.fetch_add(1, Ordering::Relaxed);
        self.behaviours_run.fetch_add(behaviours, Ordering::Relaxed);
    }

    #[inline]
    pub fn steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn lifo(&self) {
        self.lifo_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn collected(&self) {
        self.cowns_collected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn stub_freed(&self) {
        self.stubs_freed.fetch_add(1, Ordering::Relaxed);
    }
}
