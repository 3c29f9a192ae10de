//! Epoch services
//!
//! Two unrelated notions of "epoch" live here and must not be confused:
//!
//! - [`EpochMark`]: the per-round alternating *send epoch* tagging messages
//!   and cowns so a scan round can classify them, plus a neutral value used
//!   while a round transitions into scanning.
//! - [`GlobalEpoch`]: a monotonic *reclamation epoch* proving that a freed
//!   cown stub is unobserved by every scheduler thread before its slot is
//!   physically released.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Alternating send-epoch marker.
///
/// Scan rounds flip between `EpochA` and `EpochB`; `None` tags work sent
/// while a thread is in pre-scan, so in-flight messages during the
/// transition are unambiguously post-transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpochMark {
    None = 0,
    EpochA = 1,
    EpochB = 2,
}

impl EpochMark {
    /// The other alternating value.
    ///
    /// # Panics
    ///
    /// Panics on `EpochMark::None`; the neutral value has no successor and
    /// flipping from it is a protocol bug.
    pub fn next(self) -> Self {
        match self {
            EpochMark::EpochA => EpochMark::EpochB,
            EpochMark::EpochB => EpochMark::EpochA,
            EpochMark::None => panic!("EpochMark::None has no successor"),
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EpochMark::EpochA,
            2 => EpochMark::EpochB,
            _ => EpochMark::None,
        }
    }
}

impl fmt::Display for EpochMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochMark::None => write!(f, "none"),
            EpochMark::EpochA => write!(f, "A"),
            EpochMark::EpochB => write!(f, "B"),
        }
    }
}

/// Atomic cell holding an [`EpochMark`].
///
/// Used for the per-cown "last scanned" mark, which is written by whichever
/// thread scans the cown and read by any thread scheduling it.
#[derive(Debug)]
pub struct EpochCell(AtomicU8);

impl EpochCell {
    pub fn new(mark: EpochMark) -> Self {
        Self(AtomicU8::new(mark as u8))
    }

    pub fn load(&self) -> EpochMark {
        EpochMark::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, mark: EpochMark) {
        self.0.store(mark as u8, Ordering::Release);
    }
}

impl Default for EpochCell {
    fn default() -> Self {
        Self::new(EpochMark::None)
    }
}

/// Sentinel for "this cown was never popped while an epoch was live".
pub const NO_EPOCH: u64 = u64::MAX;

/// Monotonic global reclamation epoch with one observed-epoch slot per
/// scheduler thread.
///
/// Threads record the current global value in their slot once per scheduler
/// loop iteration. A stub's recorded `epoch_when_popped` is outdated, and
/// the stub safe to free, once every thread has observed a strictly newer
/// epoch.
#[derive(Debug)]
pub struct GlobalEpoch {
    epoch: AtomicU64,
    observed: Vec<CachePadded<AtomicU64>>,
}

impl GlobalEpoch {
    /// Create the epoch service for `num_threads` scheduler threads.
    ///
    /// The counter starts at 1 so that a slot holding 0 means "has not
    /// observed yet" and never proves anything outdated.
    pub fn new(num_threads: usize) -> Self {
        Self {
            epoch: AtomicU64::new(1),
            observed: (0..num_threads)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// The current global epoch value.
    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Bump the global epoch.
    pub fn advance(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Record the current global epoch in `thread`'s observed slot.
    pub fn observe(&self, thread: usize) {
        let now = self.epoch.load(Ordering::Acquire);
        self.observed[thread].store(now, Ordering::Release);
    }

    /// Whether `epoch` is provably stale: either it was never set, or every
    /// thread has observed a strictly greater epoch since.
    pub fn is_outdated(&self, epoch: u64) -> bool {
        if epoch == NO_EPOCH {
            return true;
        }
        self.observed
            .iter()
            .all(|slot| slot.load(Ordering::Acquire) > epoch)
    }
}

#[cfg(test)]
mod tests;
