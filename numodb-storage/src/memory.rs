//! Aligned memory blocks for page pools and log regions.
//!
//! The engine distinguishes three allocation policies taken from the memory
//! configuration: NUMA-local on a node, NUMA-interleaved across nodes, and
//! plain aligned malloc. All three are backed by `posix_memalign`; the node
//! of an on-node allocation is tracked logically so placement-sensitive
//! logic (per-node pools, partitioner bucket owners) behaves the same on a
//! machine without a NUMA library.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// numa_alloc_onnode-style placement on the given node.
    NumaAllocOnnode(u16),
    /// numa_alloc_interleaved-style placement across all nodes.
    NumaAllocInterleaved,
    /// posix_memalign without a placement hint.
    PosixMemalign,
}

pub struct AlignedMemory {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
    kind: AllocKind,
}

// The block is a plain byte region; synchronization of its content is the
// owner's responsibility.
unsafe impl Send for AlignedMemory {}
unsafe impl Sync for AlignedMemory {}

impl AlignedMemory {
    pub fn alloc(size: usize, alignment: usize, kind: AllocKind) -> Result<AlignedMemory> {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(size % alignment == 0);
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: ptr is a valid out-parameter; alignment is a power of two
        // and a multiple of pointer size by the asserts above.
        let ret = unsafe { libc::posix_memalign(&mut ptr, alignment, size) };
        if ret != 0 || ptr.is_null() {
            return Err(Error::InsufficientMemory(size));
        }
        // SAFETY: freshly allocated block of `size` bytes.
        unsafe {
            std::ptr::write_bytes(ptr as *mut u8, 0, size);
        }
        Ok(AlignedMemory {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            size,
            alignment,
            kind,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// Logical NUMA node of this block, if it was an on-node allocation.
    #[inline]
    pub fn numa_node(&self) -> Option<u16> {
        match self.kind {
            AllocKind::NumaAllocOnnode(node) => Some(node),
            _ => None,
        }
    }
}

impl Drop for AlignedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated by posix_memalign in `alloc`, never freed twice.
        unsafe {
            libc::free(self.ptr.as_ptr() as *mut libc::c_void);
        }
    }
}

pub const DEFAULT_POOL_PAGES_PER_NODE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Use NUMA-local allocation instead of plain aligned malloc.
    pub use_numa_alloc: bool,
    /// Allocate interleaved instead of on-node. Meaningful only when
    /// `use_numa_alloc` is on.
    pub interleave_numa_alloc: bool,
    /// Volatile page pool capacity, in pages, per NUMA node.
    pub pool_pages_per_node: usize,
}

impl MemoryConfig {
    #[inline]
    pub fn use_numa_alloc(mut self, v: bool) -> Self {
        self.use_numa_alloc = v;
        self
    }

    #[inline]
    pub fn interleave_numa_alloc(mut self, v: bool) -> Self {
        self.interleave_numa_alloc = v;
        self
    }

    #[inline]
    pub fn pool_pages_per_node(mut self, pages: usize) -> Self {
        self.pool_pages_per_node = pages;
        self
    }

    /// Allocation policy for a block that should live on `node`.
    #[inline]
    pub fn alloc_kind(&self, node: u16) -> AllocKind {
        if !self.use_numa_alloc {
            AllocKind::PosixMemalign
        } else if self.interleave_numa_alloc {
            AllocKind::NumaAllocInterleaved
        } else {
            AllocKind::NumaAllocOnnode(node)
        }
    }
}

impl Default for MemoryConfig {
    #[inline]
    fn default() -> Self {
        MemoryConfig {
            use_numa_alloc: true,
            interleave_numa_alloc: false,
            pool_pages_per_node: DEFAULT_POOL_PAGES_PER_NODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_memory_zeroed() {
        let mem = AlignedMemory::alloc(1 << 16, 1 << 12, AllocKind::PosixMemalign).unwrap();
        assert_eq!(mem.as_ptr() as usize % (1 << 12), 0);
        assert_eq!(mem.size(), 1 << 16);
        let bytes = unsafe { std::slice::from_raw_parts(mem.as_ptr(), mem.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_alloc_kind_policy() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.alloc_kind(2), AllocKind::NumaAllocOnnode(2));
        let cfg = MemoryConfig::default().interleave_numa_alloc(true);
        assert_eq!(cfg.alloc_kind(2), AllocKind::NumaAllocInterleaved);
        let cfg = MemoryConfig::default().use_numa_alloc(false);
        assert_eq!(cfg.alloc_kind(2), AllocKind::PosixMemalign);
    }
}
