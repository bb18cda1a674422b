//! Worker: the per-thread execution context.
//!
//! A worker owns its transaction context, its redo log buffer, and a cursor
//! into its preallocated MCS blocks. The shared side (`WorkerControl`) is
//! what loggers observe: the published log ranges and the in-commit epoch
//! guard.
use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::error::Result;
use crate::log::thread_buffer::{LogBufferShared, ThreadLogBuffer};
use crate::storage::array::ArrayStorage;
use crate::storage::StorageId;
use crate::xct::xct_id::LockableXctId;
use crate::xct::Xct;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Shared-memory side of a worker, reachable by loggers.
pub struct WorkerControl {
    pub id: u16,
    pub numa_node: u16,
    /// Non-invalid only while the worker is between the pre-commit fence
    /// and log publish. Loggers must not advance the durable frontier past
    /// this epoch while it is set.
    pub in_commit_log_epoch: AtomicEpoch,
    pub log_buffer: Arc<LogBufferShared>,
}

pub struct Worker {
    engine: &'static Engine,
    pub(crate) control: Arc<WorkerControl>,
    pub(crate) xct: Xct,
    pub(crate) log_buffer: ThreadLogBuffer,
}

impl Worker {
    pub(crate) fn new(engine: &'static Engine, id: u16, numa_node: u16) -> Worker {
        let log_buffer =
            ThreadLogBuffer::new(engine.config().log.thread_buffer_size.as_u64() as usize);
        let control = Arc::new(WorkerControl {
            id,
            numa_node,
            in_commit_log_epoch: AtomicEpoch::new(Epoch::INVALID),
            log_buffer: Arc::clone(log_buffer.shared()),
        });
        Worker {
            engine,
            control,
            xct: Xct::new(),
            log_buffer,
        }
    }

    #[inline]
    pub fn engine(&self) -> &'static Engine {
        self.engine
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.control.id
    }

    #[inline]
    pub fn numa_node(&self) -> u16 {
        self.control.numa_node
    }

    #[inline]
    pub fn xct(&self) -> &Xct {
        &self.xct
    }

    #[inline]
    pub fn array(&self, id: StorageId) -> Result<ArrayStorage> {
        self.engine.storage_manager().get_array(self.engine, id)
    }

    /// Acquires the record key lock. Returns the block index used, for the
    /// matching release. The lock state lives in the MCS word only; the
    /// owner id word must compare equal across a lock/unlock pair, or
    /// read-set verification of the locker itself would fail.
    #[inline]
    pub(crate) fn mcs_acquire_lock(&mut self, owner: &LockableXctId) -> u16 {
        let block = self.xct.next_mcs_block();
        self.engine
            .mcs_arena()
            .acquire(&owner.lock, self.control.id, block);
        block
    }

    /// Releases a key lock acquired by this worker. Infallible.
    #[inline]
    pub(crate) fn mcs_release_lock(&self, owner: &LockableXctId, block: u16) {
        debug_assert!(block != 0);
        self.engine
            .mcs_arena()
            .release(&owner.lock, self.control.id, block);
    }

    #[inline]
    pub(crate) fn set_in_commit_log_epoch(&self, epoch: Epoch) {
        self.control
            .in_commit_log_epoch
            .store(epoch, Ordering::SeqCst);
    }
}
