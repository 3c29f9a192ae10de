//! Cown unit tests

use crate::runtime::cown::arena::CownArena;
use crate::runtime::cown::{Enqueue, Message};
use crate::runtime::epoch::EpochMark;

fn noop_message() -> Message {
    Message {
        mark: EpochMark::EpochA,
        behaviour: Box::new(|_| {}),
    }
}

mod queue_tests {
    use super::*;

    #[test]
    fn test_first_enqueue_wakes() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        assert!(matches!(
            inner.enqueue(noop_message()),
            Enqueue::Queued { woke: true }
        ));
        // Second enqueue finds the cown already awake.
        assert!(matches!(
            inner.enqueue(noop_message()),
            Enqueue::Queued { woke: false }
        ));
    }

    #[test]
    fn test_take_batch_respects_limit() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        for _ in 0..5 {
            inner.enqueue(noop_message());
        }
        assert_eq!(inner.take_batch(3).len(), 3);
        assert_eq!(inner.take_batch(3).len(), 2);
        assert!(inner.take_batch(3).is_empty());
    }

    #[test]
    fn test_finish_batch_sleeps_only_when_drained() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        inner.enqueue(noop_message());
        inner.enqueue(noop_message());
        inner.take_batch(1);
        // One message left: stays awake.
        assert!(inner.finish_batch());
        inner.take_batch(1);
        assert!(!inner.finish_batch());
        // Asleep again: the next enqueue wakes.
        assert!(matches!(
            inner.enqueue(noop_message()),
            Enqueue::Queued { woke: true }
        ));
    }

    #[test]
    fn test_force_wake_once() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        assert!(inner.force_wake());
        assert!(!inner.force_wake());
        // Waking with no message leaves nothing to run.
        assert!(inner.take_batch(8).is_empty());
        assert!(!inner.finish_batch());
    }

    #[test]
    fn test_collected_cown_rejects_messages() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        inner.enqueue(noop_message());
        let drained = inner.collect().expect("first collect succeeds");
        assert_eq!(drained.len(), 1);
        assert!(inner.collect().is_none());

        assert!(matches!(
            inner.enqueue(noop_message()),
            Enqueue::Rejected(_)
        ));
        assert!(!inner.force_wake());
    }
}

mod handle_tests {
    use super::*;

    #[test]
    fn test_root_blocks_release() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = cown.ptr().inner.clone();

        // Held root: release refuses.
        assert!(inner.release_if_unrooted().is_none());
        drop(cown);
        assert!(inner.release_if_unrooted().is_some());
        assert!(inner.is_collected());
    }

    #[test]
    fn test_root_from_ptr_fails_after_collect() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let ptr = cown.ptr().clone();

        assert!(ptr.root().is_some());
        drop(cown);
        ptr.inner.release_if_unrooted();
        assert!(ptr.root().is_none());
        assert!(ptr.is_collected());
    }

    #[test]
    fn test_weak_upgrade() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let weak = cown.downgrade();
        assert_eq!(cown.ptr().inner.weak_count(), 1);

        let ptr = cown.ptr().clone();
        assert!(weak.upgrade().is_some());
        drop(cown);
        ptr.inner.release_if_unrooted();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_bind_is_first_touch_only() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        assert_eq!(inner.binding(), None);
        assert!(inner.bind(3));
        assert!(!inner.bind(5));
        assert_eq!(inner.binding(), Some(3));
    }
}

mod scan_tests {
    use super::*;

    #[test]
    fn test_neutral_epoch_always_scanned() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        assert!(inner.scanned(EpochMark::None));
        assert!(!inner.scanned(EpochMark::EpochB));
        inner.mark_scanned(EpochMark::EpochB);
        assert!(inner.scanned(EpochMark::EpochB));
        assert!(!inner.scanned(EpochMark::EpochA));
    }

    #[test]
    fn test_try_collect_spares_scanned_cowns() {
        let arena = CownArena::new();
        let cown = arena.alloc(Box::new(()), false);
        let inner = &cown.ptr().inner;

        inner.mark_scanned(EpochMark::EpochA);
        assert!(inner.try_collect(EpochMark::EpochA).is_none());
        assert!(inner.try_collect(EpochMark::EpochB).is_some());
        // Already collected: a later round is a no-op.
        assert!(inner.try_collect(EpochMark::EpochB).is_none());
    }
}

mod arena_tests {
    use super::*;

    #[test]
    fn test_alloc_and_release() {
        let arena = CownArena::new();
        let a = arena.alloc(Box::new(()), false);
        let b = arena.alloc(Box::new(()), true);
        assert_eq!(arena.len(), 2);
        assert_ne!(a.id(), b.id());
        assert!(b.ptr().inner.can_lifo_schedule());
        assert!(!a.ptr().inner.can_lifo_schedule());

        arena.release(a.id());
        assert_eq!(arena.len(), 1);
        // Release is idempotent.
        arena.release(a.id());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_drain_empties_arena() {
        let arena = CownArena::new();
        arena.alloc(Box::new(()), false);
        arena.alloc(Box::new(()), false);
        assert_eq!(arena.drain().len(), 2);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_id_display() {
        let arena = CownArena::new();
        let a = arena.alloc(Box::new(()), false);
        assert!(a.id().to_string().starts_with("cown#"));
    }
}
