//! The 64-bit owner word embedded in every record header.
//!
//! Layout: `epoch:32 | ordinal:24 | status:8`. The epoch/ordinal pair
//! identifies the last committed transaction that wrote the record; the
//! status byte carries the record state bits. A writer sets `BEING_WRITTEN`
//! before mutating the payload and clears it by overwriting the whole word
//! with the new `{epoch, ordinal}`. `MOVED` is one-way: once set, the record
//! has been forwarded and accessors must re-locate it.
use crate::epoch::Epoch;
use crate::xct::mcs::McsLock;
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XctStatus: u8 {
        const KEY_LOCKED = 0x80;
        const BEING_WRITTEN = 0x40;
        const DELETED = 0x20;
        const MOVED = 0x10;
    }
}

pub const MAX_ORDINAL: u32 = (1 << 24) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XctId(u64);

impl XctId {
    pub const INVALID: XctId = XctId(0);

    #[inline]
    pub fn new(epoch: Epoch, ordinal: u32) -> XctId {
        debug_assert!(ordinal <= MAX_ORDINAL);
        XctId(((epoch.value() as u64) << 32) | ((ordinal as u64) << 8))
    }

    #[inline]
    pub const fn from_word(word: u64) -> XctId {
        XctId(word)
    }

    #[inline]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn epoch(self) -> Epoch {
        Epoch::new((self.0 >> 32) as u32)
    }

    #[inline]
    pub fn ordinal(self) -> u32 {
        ((self.0 >> 8) & MAX_ORDINAL as u64) as u32
    }

    #[inline]
    pub fn status(self) -> XctStatus {
        XctStatus::from_bits_truncate(self.0 as u8)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.epoch().is_valid()
    }

    #[inline]
    pub fn is_deleted(self) -> bool {
        self.status().contains(XctStatus::DELETED)
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        self.status().contains(XctStatus::MOVED)
    }

    #[inline]
    pub fn is_being_written(self) -> bool {
        self.status().contains(XctStatus::BEING_WRITTEN)
    }

    #[inline]
    #[must_use]
    pub fn with_status(self, status: XctStatus) -> XctId {
        XctId((self.0 & !0xFF) | status.bits() as u64)
    }

    #[inline]
    #[must_use]
    pub fn clear_status_bits(self) -> XctId {
        XctId(self.0 & !0xFF)
    }

    /// Lexicographic (epoch, ordinal) ordering with cyclic epochs.
    /// Identical words mean "same commit", which is not "before".
    #[inline]
    pub fn before(self, other: XctId) -> bool {
        let (se, oe) = (self.epoch(), other.epoch());
        if se != oe {
            return se.before(oe);
        }
        self.ordinal() < other.ordinal()
    }

    /// Keeps the lexicographically-larger id. Invalid `other` is a no-op.
    #[inline]
    pub fn store_max(&mut self, other: XctId) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }
}

impl fmt::Debug for XctId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "XctId({}, ord={}, status={:?})",
            self.epoch(),
            self.ordinal(),
            self.status()
        )
    }
}

/// Per-record owner header: the MCS key-lock word plus the owner id.
///
/// This is the atomic footprint a committing writer touches. The lock state
/// lives in the MCS word only; the owner id word is left untouched by
/// lock/unlock so that read-set verification can compare it bit-for-bit.
/// The `KEY_LOCKED` status bit is reserved for externalized owner words.
#[repr(C)]
pub struct LockableXctId {
    pub lock: McsLock,
    xct_id: AtomicU64,
}

impl LockableXctId {
    #[inline]
    pub const fn new() -> LockableXctId {
        LockableXctId {
            lock: McsLock::new(),
            xct_id: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn xct_id(&self) -> XctId {
        XctId(self.xct_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_xct_id(&self, id: XctId) {
        self.xct_id.store(id.0, Ordering::Release);
    }

    #[inline]
    pub fn set_status(&self, status: XctStatus) {
        self.xct_id.fetch_or(status.bits() as u64, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_status(&self, status: XctStatus) {
        self.xct_id
            .fetch_and(!(status.bits() as u64), Ordering::AcqRel);
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.xct_id().is_moved()
    }

    #[inline]
    pub fn is_keylocked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Owner id with `BEING_WRITTEN` settled: spins until the concurrent
    /// writer finishes overwriting the word.
    #[inline]
    pub fn stable_xct_id(&self) -> XctId {
        loop {
            let id = self.xct_id();
            if !id.is_being_written() {
                return id;
            }
            std::hint::spin_loop();
        }
    }
}

impl Default for LockableXctId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xct_id_packing() {
        let id = XctId::new(Epoch::new(42), 7);
        assert_eq!(id.epoch(), Epoch::new(42));
        assert_eq!(id.ordinal(), 7);
        assert!(id.status().is_empty());
        assert!(id.is_valid());
        assert!(!XctId::INVALID.is_valid());

        let id = XctId::new(Epoch::new(u32::MAX), MAX_ORDINAL);
        assert_eq!(id.epoch(), Epoch::new(u32::MAX));
        assert_eq!(id.ordinal(), MAX_ORDINAL);
    }

    #[test]
    fn test_xct_id_status_bits() {
        let id = XctId::new(Epoch::new(3), 1).with_status(XctStatus::DELETED | XctStatus::MOVED);
        assert!(id.is_deleted());
        assert!(id.is_moved());
        assert!(!id.is_being_written());
        let cleared = id.clear_status_bits();
        assert!(cleared.status().is_empty());
        assert_eq!(cleared.epoch(), Epoch::new(3));
        assert_eq!(cleared.ordinal(), 1);
    }

    #[test]
    fn test_xct_id_ordering() {
        let a = XctId::new(Epoch::new(5), 1);
        let b = XctId::new(Epoch::new(5), 2);
        let c = XctId::new(Epoch::new(6), 1);
        assert!(a.before(b));
        assert!(b.before(c));
        assert!(!a.before(a)); // same word: same commit
        assert!(!b.before(a));

        let mut m = XctId::INVALID;
        m.store_max(a);
        assert_eq!(m, a);
        m.store_max(c);
        assert_eq!(m, c);
        m.store_max(b);
        assert_eq!(m, c);
    }

    #[test]
    fn test_lockable_owner_word() {
        let owner = LockableXctId::new();
        assert!(!owner.is_keylocked());
        assert!(!owner.is_moved());
        owner.set_xct_id(XctId::new(Epoch::new(2), 9));
        owner.set_status(XctStatus::MOVED);
        assert!(owner.is_moved());
        assert_eq!(owner.xct_id().ordinal(), 9);
        assert_eq!(owner.stable_xct_id().epoch(), Epoch::new(2));
    }
}
