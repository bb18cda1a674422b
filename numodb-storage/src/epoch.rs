//! Coarse-grained logical timestamp.
//!
//! An epoch is the unit of durability and of read-set timestamping. It is a
//! 32-bit integer in [1, u32::MAX] with wrap-around arithmetic; 0 is the
//! "invalid" sentinel. Because the value wraps, comparison is cyclic:
//! `a.before(b)` iff the distance from `a` to `b` is in (0, 2^31).
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub type EpochInt = u32;

/// First epoch that can ever become durable.
pub const INITIAL_DURABLE_EPOCH: Epoch = Epoch(1);
/// Epoch the system starts issuing commits in. Two epochs ahead of the
/// initial durable epoch so that `one_less()` of the current epoch is always
/// a valid flush bound.
pub const INITIAL_CURRENT_EPOCH: Epoch = Epoch(3);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(EpochInt);

impl Epoch {
    pub const INVALID: Epoch = Epoch(0);

    #[inline]
    pub const fn new(value: EpochInt) -> Epoch {
        Epoch(value)
    }

    #[inline]
    pub const fn value(self) -> EpochInt {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Next epoch, skipping the invalid sentinel on wrap-around.
    #[inline]
    pub const fn one_more(self) -> Epoch {
        if self.0 == EpochInt::MAX {
            Epoch(1)
        } else {
            Epoch(self.0 + 1)
        }
    }

    /// Previous epoch, skipping the invalid sentinel on wrap-around.
    #[inline]
    pub const fn one_less(self) -> Epoch {
        if self.0 <= 1 {
            Epoch(EpochInt::MAX)
        } else {
            Epoch(self.0 - 1)
        }
    }

    /// Cyclic "happens-before". Both epochs must be valid.
    #[inline]
    pub fn before(self, other: Epoch) -> bool {
        debug_assert!(self.is_valid());
        debug_assert!(other.is_valid());
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < (1 << 31)
    }

    /// Keeps the cyclically-larger of the two. An invalid `other` is a no-op;
    /// an invalid `self` is simply overwritten.
    #[inline]
    pub fn store_max(&mut self, other: Epoch) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }

    #[inline]
    pub fn min(self, other: Epoch) -> Epoch {
        if self.before(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Epoch({})", self.0)
        } else {
            write!(f, "Epoch(INVALID)")
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared-memory resident epoch with atomic load/store.
#[repr(transparent)]
pub struct AtomicEpoch(AtomicU32);

impl AtomicEpoch {
    #[inline]
    pub const fn new(epoch: Epoch) -> AtomicEpoch {
        AtomicEpoch(AtomicU32::new(epoch.0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Epoch {
        Epoch(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, epoch: Epoch, order: Ordering) {
        self.0.store(epoch.0, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_validity() {
        assert!(!Epoch::INVALID.is_valid());
        assert!(Epoch::new(1).is_valid());
        assert!(Epoch::new(EpochInt::MAX).is_valid());
    }

    #[test]
    fn test_epoch_one_more_skips_invalid() {
        assert_eq!(Epoch::new(1).one_more(), Epoch::new(2));
        assert_eq!(Epoch::new(EpochInt::MAX).one_more(), Epoch::new(1));
        assert_eq!(Epoch::new(1).one_less(), Epoch::new(EpochInt::MAX));
    }

    #[test]
    fn test_epoch_cyclic_before() {
        let a = Epoch::new(1);
        let b = Epoch::new(2);
        assert!(a.before(b));
        assert!(!b.before(a));
        assert!(!a.before(a));

        // wrap-around: MAX is before 1 in cyclic order
        let hi = Epoch::new(EpochInt::MAX);
        let lo = Epoch::new(1);
        assert!(hi.before(lo));
        assert!(!lo.before(hi));

        // half-ring boundary
        let far = Epoch::new(1 + (1 << 31));
        assert!(!lo.before(far)); // exactly 2^31 away is not "before"
    }

    #[test]
    fn test_epoch_store_max() {
        let mut e = Epoch::INVALID;
        e.store_max(Epoch::INVALID);
        assert!(!e.is_valid());
        e.store_max(Epoch::new(3));
        assert_eq!(e, Epoch::new(3));
        e.store_max(Epoch::new(2));
        assert_eq!(e, Epoch::new(3));
        e.store_max(Epoch::new(10));
        assert_eq!(e, Epoch::new(10));
    }

    #[test]
    fn test_atomic_epoch() {
        let a = AtomicEpoch::new(Epoch::new(5));
        assert_eq!(a.load(Ordering::Relaxed), Epoch::new(5));
        a.store(Epoch::new(6), Ordering::SeqCst);
        assert_eq!(a.load(Ordering::SeqCst), Epoch::new(6));
    }
}
