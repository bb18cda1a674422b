//! The log gleaner: a per-snapshot map-reduce pipeline.
//!
//! Topology: one mapper per logger (pinned to the logger's node) and one
//! reducer per node. Mappers read the durable log stream, look up (or
//! create) the partitioner of each record's storage, and push the record to
//! its destination reducer. Reducers sort by (storage, key, xct_id),
//! spilling to disk on overflow, and emit snapshot pages. After all
//! reducers complete, per-storage root pages are constructed and installed.
//!
//! A run walks: init -> ready barrier -> processing -> drain-mappers-early
//! -> finalize, or jumps to cancel on the first error or stop request.
use crate::engine::Engine;
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::log::record::LogKind;
use crate::memory::{AlignedMemory, AllocKind};
use crate::snapshot::{mapper, reducer, SnapshotId};
use crate::storage::page::{Page, SnapshotPagePointer, INTERIOR_FANOUT};
use crate::storage::partition::{PartitionId, Partitioner};
use crate::storage::{StorageId, StorageKind};
use crate::thread;
use crate::xct::xct_id::XctId;
use parking_lot::{Condvar, Mutex};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One record on its way from a mapper to a reducer.
pub(crate) struct SortEntry {
    pub storage_id: StorageId,
    pub kind: LogKind,
    /// Partitioning/sort key; the array offset for array records.
    pub key: u64,
    pub xct_id: XctId,
    pub payload: Vec<u8>,
}

impl SortEntry {
    /// Sort order of the reducer: (storage, key, commit id). Within one
    /// gleaned window epochs do not wrap, so the raw xct_id word orders
    /// commits correctly.
    #[inline]
    pub fn sort_key(&self) -> (StorageId, u64, u64) {
        (self.storage_id, self.key, self.xct_id.word())
    }
}

/// What one reducer produced: snapshot leaf pages per (storage, child slot).
pub(crate) struct ReducerOutput {
    pub pages: Vec<(StorageId, usize, SnapshotPagePointer)>,
}

/// Interleaved buffer collecting storage-level (non-record) logs from all
/// mappers; position claims are a single atomic add.
pub(crate) struct NonrecordLogBuffer {
    memory: AlignedMemory,
    pos: AtomicUsize,
}

impl NonrecordLogBuffer {
    fn new(size: usize) -> Result<NonrecordLogBuffer> {
        let memory = AlignedMemory::alloc(size, 4096, AllocKind::NumaAllocInterleaved)?;
        Ok(NonrecordLogBuffer {
            memory,
            pos: AtomicUsize::new(0),
        })
    }

    pub fn add(&self, bytes: &[u8]) {
        let begin = self.pos.fetch_add(bytes.len(), Ordering::Relaxed);
        // the buffer is sized generously; storage logs are tiny and rare.
        assert!(begin + bytes.len() <= self.memory.size());
        // SAFETY: [begin, begin+len) was exclusively claimed above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.memory.as_ptr().add(begin),
                bytes.len(),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.pos.load(Ordering::Acquire)
    }
}

pub struct LogGleaner {
    engine: &'static Engine,
    snapshot_id: SnapshotId,
    base_epoch: Epoch,
    valid_until_epoch: Epoch,

    ready_to_start: AtomicU32,
    completed: AtomicU32,
    completed_mappers: AtomicU32,
    exit_count: AtomicU32,
    error_count: AtomicU32,
    errors: Mutex<Vec<String>>,
    stop_requested: AtomicBool,

    start: Mutex<bool>,
    start_cv: Condvar,
    /// Mappers and reducers poke this to wake the gleaner driver.
    wakeup: Mutex<()>,
    wakeup_cv: Condvar,

    partitioners: Mutex<HashMap<StorageId, Arc<Partitioner>>>,
    nonrecord_log: NonrecordLogBuffer,
}

impl LogGleaner {
    pub fn new(
        engine: &'static Engine,
        snapshot_id: SnapshotId,
        base_epoch: Epoch,
        valid_until_epoch: Epoch,
    ) -> Arc<LogGleaner> {
        let nonrecord_size = engine
            .config()
            .snapshot
            .nonrecord_log_buffer_size
            .as_u64() as usize;
        Arc::new(LogGleaner {
            engine,
            snapshot_id,
            base_epoch,
            valid_until_epoch,
            ready_to_start: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            completed_mappers: AtomicU32::new(0),
            exit_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            errors: Mutex::new(Vec::new()),
            stop_requested: AtomicBool::new(false),
            start: Mutex::new(false),
            start_cv: Condvar::new(),
            wakeup: Mutex::new(()),
            wakeup_cv: Condvar::new(),
            partitioners: Mutex::new(HashMap::new()),
            nonrecord_log: NonrecordLogBuffer::new(nonrecord_size)
                .expect("nonrecord log buffer allocation"),
        })
    }

    #[inline]
    pub(crate) fn engine(&self) -> &'static Engine {
        self.engine
    }

    #[inline]
    pub(crate) fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    #[inline]
    pub(crate) fn base_epoch(&self) -> Epoch {
        self.base_epoch
    }

    #[inline]
    pub(crate) fn valid_until_epoch(&self) -> Epoch {
        self.valid_until_epoch
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Asks every component to stop within one loop iteration.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let g = self.start.lock();
        self.start_cv.notify_all();
        drop(g);
        self.wakeup();
    }

    #[inline]
    pub(crate) fn wakeup(&self) {
        let g = self.wakeup.lock();
        self.wakeup_cv.notify_all();
        drop(g);
    }

    pub(crate) fn report_error(&self, message: String) {
        tracing::error!(message = %message, "gleaner component error");
        self.errors.lock().push(message);
        self.error_count.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    pub(crate) fn on_component_exit(&self) {
        self.exit_count.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    /// Called by each component once initialized; blocks until the gleaner
    /// fires the start signal. Returns false when the run was cancelled.
    pub(crate) fn ready_and_wait_for_start(&self) -> bool {
        self.ready_to_start.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
        let mut started = self.start.lock();
        while !*started && !self.is_stop_requested() {
            self.start_cv.wait_for(&mut started, Duration::from_millis(100));
        }
        !self.is_stop_requested()
    }

    pub(crate) fn mapper_completed(&self) {
        self.completed_mappers.fetch_add(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    pub(crate) fn reducer_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.wakeup();
    }

    /// Routes a storage-level log into the interleaved non-record buffer.
    pub(crate) fn add_nonrecord_log(&self, bytes: &[u8]) {
        self.nonrecord_log.add(bytes);
    }

    /// Partitioner cache: double-checked locking; the loser of a creation
    /// race drops its speculative partitioner.
    pub(crate) fn get_or_create_partitioner(
        &self,
        storage_id: StorageId,
    ) -> Result<Arc<Partitioner>> {
        {
            let g = self.partitioners.lock();
            if let Some(p) = g.get(&storage_id) {
                return Ok(Arc::clone(p));
            }
        }
        // create out of the critical section to avoid contention.
        let speculative = Arc::new(Partitioner::create(self.engine, storage_id)?);
        let mut g = self.partitioners.lock();
        match g.get(&storage_id) {
            Some(winner) => Ok(Arc::clone(winner)), // ours is dropped
            None => {
                g.insert(storage_id, Arc::clone(&speculative));
                Ok(speculative)
            }
        }
    }

    pub(crate) fn partitioner_count(&self) -> usize {
        self.partitioners.lock().len()
    }

    /// Runs the whole pipeline to completion or cancellation.
    pub fn execute(self: Arc<Self>) -> Result<()> {
        let nodes = self.engine.page_pools().nodes();
        let loggers = self.engine.log_manager().loggers();
        let mapper_count = loggers.len() as u32;
        let reducer_count = nodes as u32;
        let total = mapper_count + reducer_count;
        tracing::info!(
            snapshot_id = self.snapshot_id,
            mappers = mapper_count,
            reducers = reducer_count,
            "gleaner starting"
        );

        // wire the mapper -> reducer queues and the result channel.
        let mut input_txs: Vec<flume::Sender<Vec<SortEntry>>> = Vec::new();
        let mut input_rxs: Vec<flume::Receiver<Vec<SortEntry>>> = Vec::new();
        for _ in 0..nodes {
            let (tx, rx) = flume::unbounded();
            input_txs.push(tx);
            input_rxs.push(rx);
        }
        let (result_tx, result_rx) = flume::unbounded::<ReducerOutput>();

        let mut reducer_handles: Vec<JoinHandle<()>> = Vec::new();
        for (node, rx) in input_rxs.into_iter().enumerate() {
            let gleaner = Arc::clone(&self);
            let result_tx = result_tx.clone();
            reducer_handles.push(thread::spawn_named(
                format!("gleaner-reducer-{node}"),
                move || reducer::run(gleaner, node as PartitionId, rx, result_tx),
            ));
        }
        drop(result_tx);

        let mut mapper_handles: Vec<JoinHandle<()>> = Vec::new();
        for logger in loggers.iter() {
            let gleaner = Arc::clone(&self);
            let logger = Arc::clone(logger);
            let senders = input_txs.clone();
            mapper_handles.push(thread::spawn_named(
                format!("gleaner-mapper-{}", logger.id()),
                move || mapper::run(gleaner, logger, senders),
            ));
        }
        drop(input_txs);

        // ready barrier: sleep until every component reports in.
        while self.ready_to_start.load(Ordering::Acquire) < total
            && self.error_count.load(Ordering::Acquire) == 0
            && !self.is_stop_requested()
        {
            let mut g = self.wakeup.lock();
            self.wakeup_cv.wait_for(&mut g, Duration::from_millis(100));
        }

        // now let's start!
        {
            let mut started = self.start.lock();
            *started = true;
            self.start_cv.notify_all();
        }

        // wait until all components are done, tearing mappers down as soon
        // as they complete to release memory before reducer finalization.
        let mut mappers_joined = false;
        loop {
            if self.error_count.load(Ordering::Acquire) > 0 || self.is_stop_requested() {
                break;
            }
            if !mappers_joined
                && self.completed_mappers.load(Ordering::Acquire) >= mapper_count
            {
                tracing::info!("all mappers done; releasing their resources early");
                for handle in mapper_handles.drain(..) {
                    let _ = handle.join();
                }
                mappers_joined = true;
                continue;
            }
            if self.completed.load(Ordering::Acquire) >= total {
                break;
            }
            let mut g = self.wakeup.lock();
            self.wakeup_cv.wait_for(&mut g, Duration::from_millis(50));
        }

        let errors = self.error_count.load(Ordering::Acquire) as usize;
        let cancelled = self.is_stop_requested();
        if errors > 0 || cancelled {
            tracing::warn!(errors, cancelled, "gleaner run abandoned");
            // stop mappers first, then reducers; join everything.
            self.request_stop();
            for handle in mapper_handles {
                let _ = handle.join();
            }
            for handle in reducer_handles {
                let _ = handle.join();
            }
            return Err(Error::SnapshotFailed(errors.max(1)));
        }

        for handle in mapper_handles {
            let _ = handle.join();
        }
        for handle in reducer_handles {
            let _ = handle.join();
        }
        debug_assert_eq!(self.exit_count.load(Ordering::Acquire), total);

        let outputs: Vec<ReducerOutput> = result_rx.drain().collect();
        self.construct_root_pages(&outputs)?;
        tracing::info!(
            snapshot_id = self.snapshot_id,
            partitioners = self.partitioner_count(),
            nonrecord_bytes = self.nonrecord_log.len(),
            "gleaner complete"
        );
        Ok(())
    }

    /// Stitches the reducers' leaf pages under fresh per-storage root pages
    /// and swaps each storage's snapshot root pointer.
    ///
    /// Partition boundaries do not have to align with leaf boundaries, so
    /// two reducers may have emitted pages for the same array leaf; those
    /// are merged slot-wise here. Sequential child indexes are per-reducer
    /// counters and are simply renumbered.
    fn construct_root_pages(&self, outputs: &[ReducerOutput]) -> Result<()> {
        let mut per_storage: HashMap<StorageId, Vec<(usize, SnapshotPagePointer)>> = HashMap::new();
        for output in outputs {
            for (storage_id, child, ptr) in &output.pages {
                per_storage
                    .entry(*storage_id)
                    .or_default()
                    .push((*child, *ptr));
            }
        }
        for (storage_id, mut children) in per_storage {
            let cb = match self.engine.storage_manager().get_storage(storage_id) {
                Ok(cb) => cb,
                // dropped while gleaning; its pages are simply unreferenced.
                Err(_) => continue,
            };
            children.sort_by_key(|(child, _)| *child);
            let mut root = Page::new_boxed_zeroed();
            root.init_header(storage_id, 0);
            let home_node = children[0].1.numa_node();
            match cb.meta.kind {
                StorageKind::Array => {
                    let mut by_child: BTreeMap<usize, SnapshotPagePointer> = BTreeMap::new();
                    for (child, ptr) in children.drain(..) {
                        debug_assert!(child < INTERIOR_FANOUT);
                        match by_child.entry(child) {
                            Entry::Vacant(entry) => {
                                entry.insert(ptr);
                            }
                            Entry::Occupied(mut entry) => {
                                let merged = self.merge_array_leaves(&cb, *entry.get(), ptr)?;
                                entry.insert(merged);
                            }
                        }
                    }
                    for (child, ptr) in by_child {
                        root.interior_child(child).set_snapshot(ptr);
                    }
                }
                _ => {
                    for (index, (_, ptr)) in children.iter().enumerate() {
                        if index >= INTERIOR_FANOUT {
                            tracing::warn!(
                                storage_id,
                                "snapshot produced more pages than the root can reference"
                            );
                            break;
                        }
                        root.interior_child(index).set_snapshot(*ptr);
                    }
                }
            }
            let root_ptr = self
                .engine
                .snapshot_manager()
                .page_store(home_node)
                .append(root, self.snapshot_id);
            cb.root_page_pointer.set_snapshot(root_ptr);
            tracing::debug!(storage_id, "snapshot root installed");
        }
        Ok(())
    }

    /// Merges two snapshot pages of the same array leaf. Slots are disjoint
    /// between the two (a record key partitions to exactly one reducer);
    /// should both carry a slot, the younger commit wins.
    fn merge_array_leaves(
        &self,
        cb: &crate::storage::StorageControlBlock,
        a: SnapshotPagePointer,
        b: SnapshotPagePointer,
    ) -> Result<SnapshotPagePointer> {
        let payload_size = match cb.meta.spec {
            crate::storage::StorageSpec::Array { payload_size, .. } => payload_size,
            _ => return Err(Error::InvalidStorageId),
        };
        let rs = crate::storage::array::record_size(payload_size);
        let capacity = crate::storage::array::leaf_capacity(payload_size);
        let merged = Page::new_boxed_zeroed();
        let mut page_id = 0;
        for src in [a, b] {
            // SAFETY: snapshot pages are immutable and stay resident.
            let src_page = unsafe { &*self.engine.snapshot_manager().resolve_page(src)? };
            page_id = src_page.page_id();
            for slot in 0..capacity {
                let owner = src_page.leaf_record_owner(slot, rs);
                let id = owner.xct_id();
                if !id.is_valid() {
                    continue;
                }
                let dst_owner = merged.leaf_record_owner(slot, rs);
                let existing = dst_owner.xct_id();
                if existing.is_valid() && !existing.before(id) {
                    continue;
                }
                // SAFETY: the merged page is exclusively owned until
                // appended; the source payload is immutable.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src_page.leaf_record_payload(slot, rs),
                        merged.leaf_record_payload(slot, rs),
                        payload_size as usize,
                    );
                }
                dst_owner.set_xct_id(id);
            }
        }
        let mut merged = merged;
        merged.init_header(cb.meta.id, page_id);
        Ok(self
            .engine
            .snapshot_manager()
            .page_store(a.numa_node())
            .append(merged, self.snapshot_id))
    }
}
