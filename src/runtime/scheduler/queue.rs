//! Per-thread work queue
//!
//! Multi-producer, multi-consumer queue holding ready cowns plus the owning
//! thread's token. The token is an explicit tagged variant rather than a
//! low-bit pointer trick, so `pop` distinguishes "token" from "cown"
//! without special-casing queue logic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::runtime::cown::CownPtr;

/// A work queue entry: either a ready cown or some thread's token.
///
/// Tokens travel like ordinary entries when stolen; `owner` names the
/// thread whose checkpoint the token marks, not the queue it currently
/// sits in.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Token { owner: usize },
    Cown(CownPtr),
}

impl QueueEntry {
    pub fn is_token(&self) -> bool {
        matches!(self, QueueEntry::Token { .. })
    }
}

/// A thread's work queue. Push and pop are callable from any thread; the
/// mutex guarantees each entry is delivered to exactly one caller.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<VecDeque<QueueEntry>>,
    /// Count of real cown entries; the token does not count toward
    /// emptiness.
    cowns: AtomicUsize,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push to the back (FIFO). Used by the owner and by any thread
    /// redirecting work to this owner.
    pub fn push_back(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock();
        if !entry.is_token() {
            self.cowns.fetch_add(1, Ordering::AcqRel);
        }
        inner.push_back(entry);
    }

    /// Push to the front (LIFO). Externally triggered work that must run
    /// ahead of the backlog.
    pub fn push_front(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock();
        if !entry.is_token() {
            self.cowns.fetch_add(1, Ordering::AcqRel);
        }
        inner.push_front(entry);
    }

    /// Pop from the consuming end. Callable concurrently by the owner and
    /// by thieves.
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.pop_front();
        if let Some(e) = &entry {
            if !e.is_token() {
                self.cowns.fetch_sub(1, Ordering::AcqRel);
            }
        }
        entry
    }

    /// Logically empty: no cown entry remains. True even while the token
    /// is still queued.
    pub fn is_empty(&self) -> bool {
        self.cowns.load(Ordering::Acquire) == 0
    }

    /// Number of queued cowns (excludes the token).
    pub fn len(&self) -> usize {
        self.cowns.load(Ordering::Acquire)
    }

    /// Shutdown: hand back all residual entries.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        self.cowns.store(0, Ordering::Release);
        inner.drain(..).collect()
    }
}
