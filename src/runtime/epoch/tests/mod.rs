//! Epoch service unit tests

use crate::runtime::epoch::{EpochCell, EpochMark, GlobalEpoch, NO_EPOCH};

mod epoch_mark_tests {
    use super::*;

    #[test]
    fn test_alternation() {
        assert_eq!(EpochMark::EpochA.next(), EpochMark::EpochB);
        assert_eq!(EpochMark::EpochB.next(), EpochMark::EpochA);
        assert_eq!(EpochMark::EpochA.next().next(), EpochMark::EpochA);
    }

    #[test]
    #[should_panic(expected = "no successor")]
    fn test_none_has_no_successor() {
        let _ = EpochMark::None.next();
    }

    #[test]
    fn test_display() {
        assert_eq!(EpochMark::EpochA.to_string(), "A");
        assert_eq!(EpochMark::EpochB.to_string(), "B");
        assert_eq!(EpochMark::None.to_string(), "none");
    }

    #[test]
    fn test_cell_round_trip() {
        let cell = EpochCell::default();
        assert_eq!(cell.load(), EpochMark::None);
        cell.store(EpochMark::EpochB);
        assert_eq!(cell.load(), EpochMark::EpochB);
        cell.store(EpochMark::EpochA);
        assert_eq!(cell.load(), EpochMark::EpochA);
    }
}

mod global_epoch_tests {
    use super::*;

    #[test]
    fn test_no_epoch_is_always_outdated() {
        let ge = GlobalEpoch::new(2);
        assert!(ge.is_outdated(NO_EPOCH));
    }

    #[test]
    fn test_unobserved_epoch_is_not_outdated() {
        let ge = GlobalEpoch::new(2);
        // No thread has observed anything yet.
        assert!(!ge.is_outdated(1));
    }

    #[test]
    fn test_outdated_requires_every_thread() {
        let ge = GlobalEpoch::new(2);
        let popped = ge.current();

        ge.advance();
        ge.observe(0);
        // Thread 1 is still behind.
        assert!(!ge.is_outdated(popped));

        ge.observe(1);
        assert!(ge.is_outdated(popped));
    }

    #[test]
    fn test_current_epoch_never_outdated_by_stale_observation() {
        let ge = GlobalEpoch::new(1);
        ge.observe(0);
        let now = ge.current();
        // Observed == now, not strictly greater.
        assert!(!ge.is_outdated(now));
        ge.advance();
        ge.observe(0);
        assert!(ge.is_outdated(now));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let ge = GlobalEpoch::new(1);
        let a = ge.current();
        ge.advance();
        ge.advance();
        assert!(ge.current() > a);
    }
}
