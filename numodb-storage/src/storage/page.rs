//! Pages, page pointers, and the dual page model.
//!
//! Every populated slot of a storage tree is a dual pointer: a volatile
//! pointer to the current mutable in-memory page and a snapshot pointer to
//! the latest immutable page produced by the gleaner. At least one of the
//! two is non-null. Volatile pages live in per-NUMA-node pools; snapshot
//! pages are content-addressed into per-node snapshot stores.
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::memory::{AlignedMemory, MemoryConfig};
use crate::storage::StorageId;
use crate::xct::xct_id::LockableXctId;
use crate::xct::{IsolationLevel, WordPtr, Xct};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Fan-out of an interior page; also the number of partitioning buckets.
pub const INTERIOR_FANOUT: usize = 128;

const _: () = assert!(INTERIOR_FANOUT * std::mem::size_of::<DualPagePointer>() <= PAGE_PAYLOAD_SIZE);

/// Page status word observed by the page-version set.
///
/// Bit 63 flags a moved page; the low bits are a modification counter for
/// structural changes.
#[repr(transparent)]
pub struct PageVersion(AtomicU64);

const PAGE_MOVED_BIT: u64 = 1 << 63;

impl PageVersion {
    #[inline]
    pub fn observe(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.observe() & PAGE_MOVED_BIT != 0
    }

    /// One-way moved flag.
    #[inline]
    pub fn set_moved(&self) {
        self.0.fetch_or(PAGE_MOVED_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Pointer word to a volatile page: `{node:16 | offset:48}`; 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilePagePointer(u64);

impl VolatilePagePointer {
    pub const NULL: VolatilePagePointer = VolatilePagePointer(0);

    #[inline]
    pub fn new(node: u16, offset: u64) -> VolatilePagePointer {
        debug_assert!(offset != 0 && offset < (1 << 48));
        VolatilePagePointer(((node as u64) << 48) | offset)
    }

    #[inline]
    pub const fn from_word(word: u64) -> VolatilePagePointer {
        VolatilePagePointer(word)
    }

    #[inline]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn numa_node(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & ((1 << 48) - 1)
    }
}

/// Pointer word to an immutable snapshot page:
/// `{node:16 | snapshot_id:16 | offset:32}`; 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPagePointer(u64);

impl SnapshotPagePointer {
    pub const NULL: SnapshotPagePointer = SnapshotPagePointer(0);

    #[inline]
    pub fn new(node: u16, snapshot_id: u16, offset: u32) -> SnapshotPagePointer {
        debug_assert!(offset != 0);
        SnapshotPagePointer(((node as u64) << 48) | ((snapshot_id as u64) << 32) | offset as u64)
    }

    #[inline]
    pub const fn from_word(word: u64) -> SnapshotPagePointer {
        SnapshotPagePointer(word)
    }

    #[inline]
    pub const fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn numa_node(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub fn snapshot_id(self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline]
    pub fn offset(self) -> u32 {
        self.0 as u32
    }
}

/// The volatile/snapshot pointer pair of one page slot.
#[repr(C)]
pub struct DualPagePointer {
    volatile: AtomicU64,
    snapshot: AtomicU64,
}

impl DualPagePointer {
    #[inline]
    pub const fn new() -> DualPagePointer {
        DualPagePointer {
            volatile: AtomicU64::new(0),
            snapshot: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn volatile_ptr(&self) -> VolatilePagePointer {
        VolatilePagePointer(self.volatile.load(Ordering::Acquire))
    }

    #[inline]
    pub fn snapshot_ptr(&self) -> SnapshotPagePointer {
        SnapshotPagePointer(self.snapshot.load(Ordering::Acquire))
    }

    /// The volatile word itself, for pointer-set registration.
    #[inline]
    pub fn volatile_word(&self) -> &AtomicU64 {
        &self.volatile
    }

    #[inline]
    pub fn set_volatile(&self, ptr: VolatilePagePointer) {
        self.volatile.store(ptr.word(), Ordering::Release);
    }

    #[inline]
    pub fn set_snapshot(&self, ptr: SnapshotPagePointer) {
        self.snapshot.store(ptr.word(), Ordering::Release);
    }

    /// Installs a volatile page into an empty slot. On failure returns the
    /// pointer that won the race.
    #[inline]
    pub fn install_volatile(
        &self,
        new: VolatilePagePointer,
    ) -> std::result::Result<(), VolatilePagePointer> {
        match self.volatile.compare_exchange(
            0,
            new.word(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(winner) => Err(VolatilePagePointer(winner)),
        }
    }
}

impl Default for DualPagePointer {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
pub struct PageHeader {
    pub version: PageVersion,
    storage_id: StorageId,
    _pad: u32,
    page_id: u64,
}

/// A fixed-size page. The payload is reinterpreted per storage kind: an
/// interior page holds an array of dual pointers, a leaf page holds records
/// (owner header + payload each).
#[repr(C, align(8))]
pub struct Page {
    header: PageHeader,
    payload: UnsafeCell<[u8; PAGE_PAYLOAD_SIZE]>,
}

const _: () = assert!(std::mem::size_of::<Page>() == PAGE_SIZE);

// Payload mutation is guarded by record key locks (leaf records), CAS
// (interior dual-pointer words), or exclusive ownership (page construction).
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Heap-allocates a zeroed page (valid: null pointers, invalid owners).
    pub fn new_boxed_zeroed() -> Box<Page> {
        let layout = std::alloc::Layout::new::<Page>();
        // SAFETY: all-zero bytes are a valid Page (atomics at 0, zeroed
        // payload); the allocation matches the layout.
        unsafe {
            let ptr = std::alloc::alloc_zeroed(layout) as *mut Page;
            assert!(!ptr.is_null(), "page allocation failed");
            Box::from_raw(ptr)
        }
    }

    #[inline]
    pub fn storage_id(&self) -> StorageId {
        self.header.storage_id
    }

    #[inline]
    pub fn page_id(&self) -> u64 {
        self.header.page_id
    }

    #[inline]
    pub fn version(&self) -> &PageVersion {
        &self.header.version
    }

    /// Initializes the header of a freshly allocated (zeroed) page.
    #[inline]
    pub fn init_header(&mut self, storage_id: StorageId, page_id: u64) {
        self.header.storage_id = storage_id;
        self.header.page_id = page_id;
    }

    #[inline]
    pub fn interior_child(&self, index: usize) -> &DualPagePointer {
        debug_assert!(index < INTERIOR_FANOUT);
        // SAFETY: interior pages lay out their payload as dual pointers; the
        // payload is 8-aligned and zero-initialized (null pointers).
        unsafe {
            let base = self.payload.get() as *const DualPagePointer;
            &*base.add(index)
        }
    }

    /// Owner word of the record at `index` in a leaf page.
    #[inline]
    pub fn leaf_record_owner(&self, index: usize, record_size: usize) -> &LockableXctId {
        debug_assert!((index + 1) * record_size <= PAGE_PAYLOAD_SIZE);
        // SAFETY: leaf record slots start with a LockableXctId; slots are
        // 8-aligned and zero-initialized (invalid, unlocked owner).
        unsafe {
            let base = (self.payload.get() as *const u8).add(index * record_size);
            &*(base as *const LockableXctId)
        }
    }

    /// Payload bytes of the record at `index` in a leaf page.
    #[inline]
    pub fn leaf_record_payload(&self, index: usize, record_size: usize) -> *mut u8 {
        debug_assert!((index + 1) * record_size <= PAGE_PAYLOAD_SIZE);
        let header = std::mem::size_of::<LockableXctId>();
        // SAFETY: in-bounds by the assert; mutation is guarded by the
        // record's key lock.
        unsafe { (self.payload.get() as *mut u8).add(index * record_size + header) }
    }

    #[inline]
    pub fn payload_ptr(&self) -> *mut u8 {
        self.payload.get() as *mut u8
    }
}

/// Per-node pool of volatile pages. Offset 0 is reserved so that a null
/// pointer word never aliases a real page.
pub struct VolatilePagePool {
    node: u16,
    memory: AlignedMemory,
    capacity: usize,
    free_list: Mutex<Vec<u64>>,
}

impl VolatilePagePool {
    pub fn new(node: u16, config: &MemoryConfig) -> Result<VolatilePagePool> {
        let capacity = config.pool_pages_per_node;
        let memory = AlignedMemory::alloc(capacity * PAGE_SIZE, PAGE_SIZE, config.alloc_kind(node))?;
        let free_list = (1..capacity as u64).rev().collect();
        Ok(VolatilePagePool {
            node,
            memory,
            capacity,
            free_list: Mutex::new(free_list),
        })
    }

    #[inline]
    pub fn node(&self) -> u16 {
        self.node
    }

    pub fn allocate(&self) -> Result<VolatilePagePointer> {
        let mut g = self.free_list.lock();
        match g.pop() {
            Some(offset) => Ok(VolatilePagePointer::new(self.node, offset)),
            None => Err(Error::InsufficientMemory(PAGE_SIZE)),
        }
    }

    pub fn release(&self, ptr: VolatilePagePointer) {
        debug_assert_eq!(ptr.numa_node(), self.node);
        let offset = ptr.offset();
        debug_assert!(offset != 0 && (offset as usize) < self.capacity);
        // scrub so the next allocation starts from a zeroed page.
        // SAFETY: offset is in-bounds; the releasing caller owns the page.
        unsafe {
            std::ptr::write_bytes(self.page(offset) as *mut u8, 0, PAGE_SIZE);
        }
        self.free_list.lock().push(offset);
    }

    #[inline]
    pub fn page(&self, offset: u64) -> *mut Page {
        debug_assert!(offset != 0 && (offset as usize) < self.capacity);
        // SAFETY: in-bounds within the pool's aligned block.
        unsafe { (self.memory.as_ptr() as *mut Page).add(offset as usize) }
    }
}

/// Resolves volatile page pointers across all nodes.
pub struct PagePoolSet {
    pools: Box<[VolatilePagePool]>,
}

impl PagePoolSet {
    pub fn new(nodes: u16, config: &MemoryConfig) -> Result<PagePoolSet> {
        let mut pools = Vec::with_capacity(nodes as usize);
        for node in 0..nodes {
            pools.push(VolatilePagePool::new(node, config)?);
        }
        Ok(PagePoolSet {
            pools: pools.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn pool(&self, node: u16) -> &VolatilePagePool {
        &self.pools[node as usize]
    }

    #[inline]
    pub fn nodes(&self) -> u16 {
        self.pools.len() as u16
    }

    #[inline]
    pub fn resolve(&self, ptr: VolatilePagePointer) -> *mut Page {
        debug_assert!(!ptr.is_null());
        self.pools[ptr.numa_node() as usize].page(ptr.offset())
    }

    #[inline]
    pub fn release(&self, ptr: VolatilePagePointer) {
        self.pools[ptr.numa_node() as usize].release(ptr);
    }
}

/// Outcome of a successful pointer follow.
pub struct FollowedPage {
    pub page: *mut Page,
    pub followed_snapshot: bool,
}

/// Turns a dual pointer into a readable page, registering the observed
/// volatile word into the pointer set so that a concurrent pointer
/// replacement is detected at commit.
pub fn follow_pointer_for_read(
    engine: &Engine,
    xct: &mut Xct,
    dual: &DualPagePointer,
) -> Result<FollowedPage> {
    let volatile = dual.volatile_ptr();
    let prefer_snapshot =
        xct.isolation_level() == IsolationLevel::Snapshot || volatile.is_null();
    if prefer_snapshot {
        let snapshot = dual.snapshot_ptr();
        if !snapshot.is_null() {
            let page = engine.snapshot_manager().resolve_page(snapshot)?;
            return Ok(FollowedPage {
                page: page as *mut Page,
                followed_snapshot: true,
            });
        }
        if volatile.is_null() {
            return Err(Error::InvalidArgument);
        }
    }
    if xct.isolation_level() == IsolationLevel::Serializable {
        xct.add_to_pointer_set(WordPtr::new(dual.volatile_word()), volatile.word());
    }
    let page = engine.page_pools().resolve(volatile);
    // SAFETY: resolved pages stay mapped for the engine lifetime.
    let version = unsafe { (*page).version() };
    if version.is_moved() {
        return Err(Error::PageMoved);
    }
    Ok(FollowedPage {
        page,
        followed_snapshot: false,
    })
}

/// Turns a dual pointer into a writable volatile page, installing one via
/// compare-and-swap when the slot only has a snapshot page.
pub fn follow_pointer_for_write(
    engine: &Engine,
    node: u16,
    dual: &DualPagePointer,
) -> Result<*mut Page> {
    loop {
        let volatile = dual.volatile_ptr();
        if !volatile.is_null() {
            let page = engine.page_pools().resolve(volatile);
            // SAFETY: as above.
            if unsafe { (*page).version() }.is_moved() {
                return Err(Error::PageMoved);
            }
            return Ok(page);
        }
        let snapshot = dual.snapshot_ptr();
        let new_ptr = engine.page_pools().pool(node).allocate()?;
        let new_page = engine.page_pools().resolve(new_ptr);
        if !snapshot.is_null() {
            let src = engine.snapshot_manager().resolve_page(snapshot)?;
            // SAFETY: both pages are exclusive to this thread here: the new
            // page is not yet published, the snapshot page is immutable.
            unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, new_page as *mut u8, PAGE_SIZE);
            }
        }
        match dual.install_volatile(new_ptr) {
            Ok(()) => return Ok(new_page),
            Err(_winner) => {
                // lost the race; return ours and use the winner's page.
                engine.page_pools().release(new_ptr);
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_words() {
        let v = VolatilePagePointer::new(3, 77);
        assert_eq!(v.numa_node(), 3);
        assert_eq!(v.offset(), 77);
        assert!(!v.is_null());
        assert!(VolatilePagePointer::NULL.is_null());

        let s = SnapshotPagePointer::new(1, 9, 5);
        assert_eq!(s.numa_node(), 1);
        assert_eq!(s.snapshot_id(), 9);
        assert_eq!(s.offset(), 5);
    }

    #[test]
    fn test_dual_pointer_install_race() {
        let dual = DualPagePointer::new();
        let a = VolatilePagePointer::new(0, 1);
        let b = VolatilePagePointer::new(0, 2);
        assert!(dual.install_volatile(a).is_ok());
        assert_eq!(dual.install_volatile(b), Err(a));
        assert_eq!(dual.volatile_ptr(), a);
    }

    #[test]
    fn test_page_version_moved_is_one_way() {
        let pool = VolatilePagePool::new(0, &MemoryConfig::default().pool_pages_per_node(4))
            .unwrap();
        let ptr = pool.allocate().unwrap();
        let page = unsafe { &mut *pool.page(ptr.offset()) };
        assert!(!page.version().is_moved());
        page.version().bump();
        let observed = page.version().observe();
        page.version().set_moved();
        assert!(page.version().is_moved());
        assert_ne!(page.version().observe(), observed);
    }

    #[test]
    fn test_pool_allocate_release() {
        let pool = VolatilePagePool::new(1, &MemoryConfig::default().pool_pages_per_node(3))
            .unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        // capacity 3 means two usable pages (offset 0 reserved)
        assert!(pool.allocate().is_err());
        pool.release(a);
        let c = pool.allocate().unwrap();
        assert_eq!(c.offset(), a.offset());
    }
}
