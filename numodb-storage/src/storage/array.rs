//! Fixed-size array storage.
//!
//! An array is a two-level tree: one interior root page whose dual-pointer
//! children cover contiguous offset ranges, and leaf pages holding
//! fixed-size records (owner word + payload). The whole volatile tree is
//! built eagerly at create time, with leaves spread round-robin across NUMA
//! nodes; that placement is what the array partitioner later reads back.
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::log::record::{LogKind, LogRecord};
use crate::storage::page::{
    follow_pointer_for_read, follow_pointer_for_write, Page, INTERIOR_FANOUT, PAGE_PAYLOAD_SIZE,
};
use crate::storage::{StorageControlBlock, StorageId, StorageSpec};
use crate::worker::Worker;
use crate::xct::xct_id::LockableXctId;
use crate::xct::{IsolationLevel, OwnerPtr, PayloadPtr};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Bytes of one record slot: the owner word plus the aligned payload.
#[inline]
pub const fn record_size(payload_size: u16) -> usize {
    let raw = std::mem::size_of::<LockableXctId>() + payload_size as usize;
    (raw + 7) & !7
}

#[inline]
pub const fn leaf_capacity(payload_size: u16) -> usize {
    PAGE_PAYLOAD_SIZE / record_size(payload_size)
}

#[inline]
fn array_spec(cb: &StorageControlBlock) -> (u16, u64) {
    match cb.meta.spec {
        StorageSpec::Array {
            payload_size,
            array_size,
        } => (payload_size, array_size),
        _ => unreachable!("not an array storage"),
    }
}

/// Builds the eager volatile tree for a freshly created array.
pub fn create_volatile_tree(engine: &Engine, cb: &StorageControlBlock) -> Result<()> {
    let (payload_size, array_size) = array_spec(cb);
    let capacity = leaf_capacity(payload_size) as u64;
    if capacity == 0 {
        return Err(Error::NotSupported("payload larger than a leaf page"));
    }
    let leaves = array_size.div_ceil(capacity);
    if leaves as usize > INTERIOR_FANOUT {
        return Err(Error::NotSupported("array too large for a two-level tree"));
    }
    let pools = engine.page_pools();
    let nodes = pools.nodes();
    let root_ptr = pools.pool(0).allocate()?;
    // SAFETY: freshly allocated pages are exclusively owned until the root
    // pointer is published below.
    unsafe {
        (*pools.resolve(root_ptr)).init_header(cb.meta.id, 0);
    }
    for leaf in 0..leaves {
        let node = (leaf % nodes as u64) as u16;
        let leaf_ptr = pools.pool(node).allocate()?;
        unsafe {
            (*pools.resolve(leaf_ptr)).init_header(cb.meta.id, leaf + 1);
            (*pools.resolve(root_ptr))
                .interior_child(leaf as usize)
                .set_volatile(leaf_ptr);
        }
    }
    cb.root_page_pointer.set_volatile(root_ptr);
    Ok(())
}

/// Returns the array's volatile pages to their pools.
pub fn release_pages_recursive(engine: &Engine, cb: &StorageControlBlock) {
    let root_ptr = cb.root_page_pointer.volatile_ptr();
    if root_ptr.is_null() {
        return;
    }
    let pools = engine.page_pools();
    // SAFETY: the storage is marked for death; no transaction can reach it.
    let children: Vec<_> = {
        let root = unsafe { &*pools.resolve(root_ptr) };
        (0..INTERIOR_FANOUT)
            .map(|index| root.interior_child(index).volatile_ptr())
            .collect()
    };
    for child in children {
        if !child.is_null() {
            pools.release(child);
        }
    }
    cb.root_page_pointer.set_volatile(crate::storage::page::VolatilePagePointer::NULL);
    pools.release(root_ptr);
}

/// Applies an overwrite log to the record payload. The commit core has
/// already set BEING_WRITTEN on the owner and holds the key lock.
pub fn apply_overwrite(
    cb: &StorageControlBlock,
    record: LogRecord<'_>,
    owner: Option<OwnerPtr>,
    payload: Option<PayloadPtr>,
) {
    let (payload_size, _) = array_spec(cb);
    debug_assert!(owner.map(|o| o.get().xct_id().is_being_written()) == Some(true));
    let dst = payload.expect("array overwrite needs a payload address");
    let src = record.array_data(payload_size as usize);
    // SAFETY: dst points at a record payload of exactly payload_size bytes,
    // exclusively writable under the record's key lock.
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), payload_size as usize);
    }
}

/// Client façade over one array storage.
pub struct ArrayStorage {
    engine: &'static Engine,
    cb: Arc<StorageControlBlock>,
}

impl ArrayStorage {
    #[inline]
    pub(crate) fn new(engine: &'static Engine, cb: Arc<StorageControlBlock>) -> ArrayStorage {
        ArrayStorage { engine, cb }
    }

    #[inline]
    pub fn id(&self) -> StorageId {
        self.cb.meta.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.cb.meta.name
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.cb.exists()
    }

    #[inline]
    pub fn payload_size(&self) -> u16 {
        array_spec(&self.cb).0
    }

    #[inline]
    pub fn array_size(&self) -> u64 {
        array_spec(&self.cb).1
    }

    /// Reads one record into `out`, registering it in the read set under
    /// serializable isolation.
    pub fn get(&self, worker: &mut Worker, offset: u64, out: &mut [u8]) -> Result<()> {
        if !worker.xct.is_active() {
            return Err(Error::XctNoXct);
        }
        let (payload_size, array_size) = array_spec(&self.cb);
        if offset >= array_size {
            return Err(Error::OffsetOutOfRange);
        }
        debug_assert_eq!(out.len(), payload_size as usize);
        let rs = record_size(payload_size);
        let capacity = leaf_capacity(payload_size) as u64;

        let root = follow_pointer_for_read(self.engine, &mut worker.xct, &self.cb.root_page_pointer)?;
        // SAFETY: pages resolved by follow stay mapped for the engine
        // lifetime.
        let root_page = unsafe { &*root.page };
        let child = root_page.interior_child((offset / capacity) as usize);
        let leaf = follow_pointer_for_read(self.engine, &mut worker.xct, child)?;
        let leaf_page = unsafe { &*leaf.page };
        let index = (offset % capacity) as usize;
        let owner = leaf_page.leaf_record_owner(index, rs);
        let payload = leaf_page.leaf_record_payload(index, rs);

        // Read the payload at a stable owner id: retry while a concurrent
        // committer is between BEING_WRITTEN and the final owner store.
        loop {
            let observed = owner.stable_xct_id();
            fence(Ordering::Acquire);
            // SAFETY: in-bounds record payload; may race with a writer, in
            // which case the re-check below retries.
            unsafe {
                std::ptr::copy_nonoverlapping(payload, out.as_mut_ptr(), payload_size as usize);
            }
            fence(Ordering::Acquire);
            if owner.xct_id() == observed {
                if worker.xct.isolation_level() == IsolationLevel::Serializable
                    && !leaf.followed_snapshot
                {
                    worker
                        .xct
                        .add_to_read_set(self.id(), OwnerPtr::new(owner), observed);
                }
                return Ok(());
            }
        }
    }

    /// Registers an overwrite of one record: appends the redo log and adds
    /// the write-set entry. The mutation happens at commit apply.
    pub fn overwrite(&self, worker: &mut Worker, offset: u64, data: &[u8]) -> Result<()> {
        if !worker.xct.is_active() {
            return Err(Error::XctNoXct);
        }
        let (payload_size, array_size) = array_spec(&self.cb);
        if offset >= array_size {
            return Err(Error::OffsetOutOfRange);
        }
        debug_assert_eq!(data.len(), payload_size as usize);
        let rs = record_size(payload_size);
        let capacity = leaf_capacity(payload_size) as u64;
        let node = worker.numa_node();

        let root = follow_pointer_for_write(self.engine, node, &self.cb.root_page_pointer)?;
        let root_page = unsafe { &*root };
        let child = root_page.interior_child((offset / capacity) as usize);
        let leaf = follow_pointer_for_write(self.engine, node, child)?;
        let leaf_page: &Page = unsafe { &*leaf };
        let index = (offset % capacity) as usize;
        let owner = leaf_page.leaf_record_owner(index, rs);
        let payload = leaf_page.leaf_record_payload(index, rs);

        let log_offset = worker.log_buffer.append_record(
            LogKind::ArrayOverwrite,
            self.id(),
            &[&offset.to_le_bytes(), data],
        )?;
        worker.xct.add_to_write_set(
            self.id(),
            OwnerPtr::new(owner),
            PayloadPtr::new(payload),
            log_offset,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_geometry() {
        // 16-byte payload packs with its owner word into 32 bytes
        assert_eq!(record_size(16), 32);
        // alignment rounds odd payloads up
        assert_eq!(record_size(15), 32);
        assert_eq!(record_size(17), 40);
        assert!(leaf_capacity(16) >= 100);
        assert_eq!(leaf_capacity(16), PAGE_PAYLOAD_SIZE / 32);
    }
}
