//! Per-worker transaction context and access sets.
pub mod manager;
pub mod mcs;
pub mod xct_id;

use crate::epoch::Epoch;
use crate::storage::page::PageVersion;
use crate::storage::StorageId;
use crate::xct::xct_id::{LockableXctId, XctId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// No read validation at all. Reads may observe uncommitted data.
    Dirty,
    /// Reads resolve against the latest snapshot pages.
    Snapshot,
    /// Reads observe only committed records, without commit-time validation.
    ReadCommitted,
    /// Full Silo-style read validation.
    #[default]
    Serializable,
}

/// Address of a record's owner word. Records live in engine-owned volatile
/// pages whose lifetime spans every transaction touching them, so the
/// pointer stays valid for the whole access-set lifetime.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OwnerPtr(*const LockableXctId);

// Access sets move with their worker thread; the pointee is in shared
// engine memory.
unsafe impl Send for OwnerPtr {}
unsafe impl Sync for OwnerPtr {}

impl OwnerPtr {
    #[inline]
    pub fn new(owner: &LockableXctId) -> OwnerPtr {
        OwnerPtr(owner as *const LockableXctId)
    }

    #[inline]
    pub fn get(&self) -> &LockableXctId {
        // SAFETY: see type-level comment; pages are never released while a
        // transaction referencing them is in flight.
        unsafe { &*self.0 }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy)]
pub struct PayloadPtr(*mut u8);

unsafe impl Send for PayloadPtr {}
unsafe impl Sync for PayloadPtr {}

impl PayloadPtr {
    #[inline]
    pub fn new(ptr: *mut u8) -> PayloadPtr {
        PayloadPtr(ptr)
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0
    }
}

/// One record observation for commit-time validation.
pub struct ReadXctAccess {
    pub storage_id: StorageId,
    pub owner: OwnerPtr,
    pub observed: XctId,
}

/// One record mutation: the owner to lock, the payload to overwrite, and the
/// log entry (by offset in the thread log buffer) that encodes the change.
pub struct WriteXctAccess {
    pub storage_id: StorageId,
    pub owner: OwnerPtr,
    pub payload: PayloadPtr,
    pub log_offset: usize,
    pub mcs_block: u16,
}

/// Append-only mutation; no owner word and no locking.
pub struct LockFreeWriteXctAccess {
    pub storage_id: StorageId,
    pub log_offset: usize,
}

#[derive(Clone, Copy)]
pub struct WordPtr(*const AtomicU64);

unsafe impl Send for WordPtr {}
unsafe impl Sync for WordPtr {}

impl WordPtr {
    #[inline]
    pub fn new(word: &AtomicU64) -> WordPtr {
        WordPtr(word as *const AtomicU64)
    }

    #[inline]
    pub fn get(&self) -> &AtomicU64 {
        // SAFETY: dual page pointers live in engine-owned control blocks and
        // pages; see OwnerPtr.
        unsafe { &*self.0 }
    }
}

/// Observation of a dual page pointer's volatile word.
pub struct PointerAccess {
    pub address: WordPtr,
    pub observed: u64,
}

#[derive(Clone, Copy)]
pub struct PageVersionPtr(*const PageVersion);

unsafe impl Send for PageVersionPtr {}
unsafe impl Sync for PageVersionPtr {}

impl PageVersionPtr {
    #[inline]
    pub fn new(version: &PageVersion) -> PageVersionPtr {
        PageVersionPtr(version as *const PageVersion)
    }

    #[inline]
    pub fn get(&self) -> &PageVersion {
        // SAFETY: see OwnerPtr.
        unsafe { &*self.0 }
    }
}

/// Observation of a page's version status word.
pub struct PageVersionAccess {
    pub address: PageVersionPtr,
    pub observed: u64,
}

/// Transaction context, one per worker, reused across transactions.
pub struct Xct {
    active: bool,
    isolation_level: IsolationLevel,
    /// XctId issued at the last successful commit of this worker.
    id: XctId,
    pub(crate) read_set: Vec<ReadXctAccess>,
    pub(crate) write_set: Vec<WriteXctAccess>,
    pub(crate) lock_free_write_set: Vec<LockFreeWriteXctAccess>,
    pub(crate) pointer_set: Vec<PointerAccess>,
    pub(crate) page_version_set: Vec<PageVersionAccess>,
    mcs_block_current: u16,
}

impl Xct {
    #[inline]
    pub fn new() -> Xct {
        Xct {
            active: false,
            isolation_level: IsolationLevel::Serializable,
            id: XctId::INVALID,
            read_set: Vec::new(),
            write_set: Vec::new(),
            lock_free_write_set: Vec::new(),
            pointer_set: Vec::new(),
            page_version_set: Vec::new(),
            mcs_block_current: 0,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    #[inline]
    pub fn get_id(&self) -> XctId {
        self.id
    }

    #[inline]
    pub fn activate(&mut self, isolation_level: IsolationLevel) {
        debug_assert!(!self.active);
        self.active = true;
        self.isolation_level = isolation_level;
        self.read_set.clear();
        self.write_set.clear();
        self.lock_free_write_set.clear();
        self.pointer_set.clear();
        self.page_version_set.clear();
        self.mcs_block_current = 0;
    }

    #[inline]
    pub fn deactivate(&mut self) {
        debug_assert!(self.active);
        self.active = false;
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.lock_free_write_set.is_empty()
    }

    #[inline]
    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    #[inline]
    pub fn write_set_len(&self) -> usize {
        self.write_set.len()
    }

    #[inline]
    pub fn mcs_block_current(&self) -> u16 {
        self.mcs_block_current
    }

    /// Hands out the next MCS block index for this transaction.
    /// Block 0 is reserved for "no lock held".
    #[inline]
    pub fn next_mcs_block(&mut self) -> u16 {
        self.mcs_block_current += 1;
        self.mcs_block_current
    }

    #[inline]
    pub fn add_to_read_set(&mut self, storage_id: StorageId, owner: OwnerPtr, observed: XctId) {
        debug_assert!(self.active);
        self.read_set.push(ReadXctAccess {
            storage_id,
            owner,
            observed,
        });
    }

    #[inline]
    pub fn add_to_write_set(
        &mut self,
        storage_id: StorageId,
        owner: OwnerPtr,
        payload: PayloadPtr,
        log_offset: usize,
    ) {
        debug_assert!(self.active);
        self.write_set.push(WriteXctAccess {
            storage_id,
            owner,
            payload,
            log_offset,
            mcs_block: 0,
        });
    }

    #[inline]
    pub fn add_to_lock_free_write_set(&mut self, storage_id: StorageId, log_offset: usize) {
        debug_assert!(self.active);
        self.lock_free_write_set
            .push(LockFreeWriteXctAccess { storage_id, log_offset });
    }

    /// Registers an observed dual-pointer word so that a concurrent pointer
    /// replacement is detected at commit. Deduplicates on the address.
    #[inline]
    pub fn add_to_pointer_set(&mut self, address: WordPtr, observed: u64) {
        debug_assert!(self.active);
        for access in &self.pointer_set {
            if std::ptr::eq(access.address.get(), address.get()) {
                return;
            }
        }
        self.pointer_set.push(PointerAccess { address, observed });
    }

    #[inline]
    pub fn add_to_page_version_set(&mut self, address: PageVersionPtr, observed: u64) {
        debug_assert!(self.active);
        self.page_version_set
            .push(PageVersionAccess { address, observed });
    }

    /// Issues the id of a newly committed transaction.
    ///
    /// The ordinal is strictly monotone per epoch per worker and larger than
    /// the ordinal of every id observed in the access sets, which together
    /// give the serial order within an epoch.
    #[inline]
    pub fn issue_next_id(&mut self, max_xct_id: XctId, commit_epoch: Epoch) {
        debug_assert!(commit_epoch.is_valid());
        let mut ordinal: u32 = 1;
        if self.id.is_valid() && self.id.epoch() == commit_epoch {
            ordinal = ordinal.max(self.id.ordinal() + 1);
        }
        if max_xct_id.is_valid() && max_xct_id.epoch() == commit_epoch {
            ordinal = ordinal.max(max_xct_id.ordinal() + 1);
        }
        self.id = XctId::new(commit_epoch, ordinal);
    }
}

impl Default for Xct {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_clears_sets() {
        let mut xct = Xct::new();
        xct.activate(IsolationLevel::Serializable);
        let owner = Box::leak(Box::new(LockableXctId::new()));
        xct.add_to_read_set(1, OwnerPtr::new(owner), XctId::INVALID);
        assert_eq!(xct.read_set_len(), 1);
        assert!(xct.is_read_only());
        xct.deactivate();
        xct.activate(IsolationLevel::Serializable);
        assert_eq!(xct.read_set_len(), 0);
        assert_eq!(xct.mcs_block_current(), 0);
    }

    #[test]
    fn test_pointer_set_dedup() {
        let mut xct = Xct::new();
        xct.activate(IsolationLevel::Serializable);
        let word = Box::leak(Box::new(AtomicU64::new(7)));
        xct.add_to_pointer_set(WordPtr::new(word), 7);
        xct.add_to_pointer_set(WordPtr::new(word), 7);
        assert_eq!(xct.pointer_set.len(), 1);
    }

    #[test]
    fn test_issue_next_id_monotone_per_epoch() {
        let mut xct = Xct::new();
        let e = Epoch::new(10);
        xct.issue_next_id(XctId::INVALID, e);
        assert_eq!(xct.get_id(), XctId::new(e, 1));
        xct.issue_next_id(XctId::INVALID, e);
        assert_eq!(xct.get_id(), XctId::new(e, 2));
        // an observed id with a larger ordinal bounds the new one
        xct.issue_next_id(XctId::new(e, 9), e);
        assert_eq!(xct.get_id(), XctId::new(e, 10));
        // new epoch resets the ordinal
        xct.issue_next_id(XctId::new(e, 9), e.one_more());
        assert_eq!(xct.get_id(), XctId::new(e.one_more(), 1));
    }
}
