//! Transaction manager: begin/precommit/abort, the epoch-advance driver,
//! and wait-for-commit.
//!
//! The commit protocol is Silo-style optimistic concurrency control:
//!
//! 1. Lock the write set in address order with MCS key locks, resolving
//!    moved records first.
//! 2. Read the global epoch (the serialization point) and verify every
//!    read, pointer, and page-version observation.
//! 3. Apply the write set in order, overwrite each owner word with the new
//!    XctId, unlock, and publish the redo log.
//!
//! The memory-order contract is: data before owner, owner before unlock,
//! apply before publish.
use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch, INITIAL_CURRENT_EPOCH, INITIAL_DURABLE_EPOCH};
use crate::error::{Error, Result};
use crate::thread;
use crate::worker::Worker;
use crate::xct::xct_id::{XctId, XctStatus};
use crate::xct::IsolationLevel;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_EPOCH_ADVANCE_INTERVAL_MS: u64 = 20;
pub const DEFAULT_MCS_BLOCKS_PER_WORKER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XctConfig {
    /// Period of the epoch-advance driver.
    pub epoch_advance_interval_ms: u64,
    /// Preallocated MCS blocks per worker; bounds the write-set size.
    pub mcs_blocks_per_worker: usize,
}

impl XctConfig {
    #[inline]
    pub fn epoch_advance_interval_ms(mut self, ms: u64) -> Self {
        self.epoch_advance_interval_ms = ms;
        self
    }

    #[inline]
    pub fn mcs_blocks_per_worker(mut self, blocks: usize) -> Self {
        assert!(blocks >= 2);
        self.mcs_blocks_per_worker = blocks;
        self
    }
}

impl Default for XctConfig {
    #[inline]
    fn default() -> Self {
        XctConfig {
            epoch_advance_interval_ms: DEFAULT_EPOCH_ADVANCE_INTERVAL_MS,
            mcs_blocks_per_worker: DEFAULT_MCS_BLOCKS_PER_WORKER,
        }
    }
}

pub struct XctManager {
    initialized: AtomicBool,
    current_global_epoch: CachePadded<AtomicEpoch>,
    /// Mutex payload is the driver terminate flag.
    advance_wakeup: Mutex<bool>,
    advance_wakeup_cv: Condvar,
    epoch_advanced_mutex: Mutex<()>,
    epoch_advanced_cv: Condvar,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl XctManager {
    pub fn new() -> XctManager {
        XctManager {
            initialized: AtomicBool::new(false),
            current_global_epoch: CachePadded::new(AtomicEpoch::new(INITIAL_CURRENT_EPOCH)),
            advance_wakeup: Mutex::new(false),
            advance_wakeup_cv: Condvar::new(),
            epoch_advanced_mutex: Mutex::new(()),
            epoch_advanced_cv: Condvar::new(),
            driver: Mutex::new(None),
        }
    }

    pub fn initialize(&'static self, engine: &'static Engine) -> Result<()> {
        tracing::info!("initializing XctManager");
        if !engine.storage_manager().is_initialized() {
            return Err(Error::DependentModuleUnavailableInit);
        }
        debug_assert!(self.get_current_global_epoch().is_valid());
        *self.advance_wakeup.lock() = false;
        *self.driver.lock() = Some(thread::spawn_named("epoch-advancer", move || {
            self.handle_epoch_advance(engine)
        }));
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn uninitialize(&self, engine: &Engine) -> Result<()> {
        tracing::info!("uninitializing XctManager");
        let mut result = Ok(());
        if !engine.storage_manager().is_initialized() {
            result = Err(Error::DependentModuleUnavailableUninit);
        }
        if let Some(handle) = self.driver.lock().take() {
            {
                let mut terminate = self.advance_wakeup.lock();
                *terminate = true;
                self.advance_wakeup_cv.notify_all();
            }
            let _ = handle.join();
        }
        self.initialized.store(false, Ordering::Release);
        result
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn get_current_global_epoch(&self) -> Epoch {
        self.current_global_epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn get_current_global_epoch_weak(&self) -> Epoch {
        self.current_global_epoch.load(Ordering::Relaxed)
    }

    #[inline]
    fn is_stop_requested(&self) -> bool {
        *self.advance_wakeup.lock()
    }

    /// The epoch-advance driver. Bumps the global epoch every interval (or
    /// on demand), broadcasts the advance, and wakes the loggers.
    fn handle_epoch_advance(&self, engine: &'static Engine) {
        tracing::info!("epoch-advance driver started");
        // wait until all the other initializations are done.
        while !self.is_stop_requested() && !self.is_initialized() {
            fence(Ordering::Acquire);
            std::hint::spin_loop();
        }
        let interval = Duration::from_millis(engine.config().xct.epoch_advance_interval_ms);
        while !self.is_stop_requested() {
            {
                let mut terminate = self.advance_wakeup.lock();
                if *terminate {
                    break;
                }
                self.advance_wakeup_cv.wait_for(&mut terminate, interval);
                if *terminate {
                    break;
                }
            }
            debug_assert!(self.get_current_global_epoch().is_valid());
            {
                let _g = self.epoch_advanced_mutex.lock();
                let next = self.get_current_global_epoch().one_more();
                self.current_global_epoch.store(next, Ordering::SeqCst);
                self.epoch_advanced_cv.notify_all();
            }
            engine.log_manager().wakeup_loggers();
        }
        tracing::info!("epoch-advance driver ended");
    }

    #[inline]
    fn wakeup_epoch_advance_thread(&self) {
        let _g = self.advance_wakeup.lock();
        self.advance_wakeup_cv.notify_all();
    }

    /// Forces an advance and returns only after the epoch has changed.
    pub fn advance_current_global_epoch(&self) {
        let now = self.get_current_global_epoch();
        tracing::debug!(%now, "requesting immediate epoch advance");
        while now == self.get_current_global_epoch() {
            self.wakeup_epoch_advance_thread();
            let mut g = self.epoch_advanced_mutex.lock();
            if now != self.get_current_global_epoch() {
                break;
            }
            self.epoch_advanced_cv.wait_for(&mut g, Duration::from_millis(100));
        }
    }

    /// Waits until the given commit epoch is durable. Negative waits block
    /// indefinitely; zero polls.
    pub fn wait_for_commit(
        &self,
        engine: &Engine,
        commit_epoch: Epoch,
        wait_microseconds: i64,
    ) -> Result<()> {
        fence(Ordering::Acquire);
        // durability requires the global epoch to pass the commit epoch;
        // hurry the driver when it has not.
        let current = self.get_current_global_epoch();
        if !commit_epoch.before(current) {
            self.wakeup_epoch_advance_thread();
        }
        engine
            .log_manager()
            .wait_until_durable(commit_epoch, wait_microseconds)
    }

    pub fn begin_xct(&self, worker: &mut Worker, isolation_level: IsolationLevel) -> Result<()> {
        if worker.xct.is_active() {
            return Err(Error::XctAlreadyRunning);
        }
        worker.xct.activate(isolation_level);
        debug_assert!(worker.xct.mcs_block_current() == 0);
        debug_assert!(worker.log_buffer.offset_tail() == worker.log_buffer.offset_committed());
        Ok(())
    }

    pub fn abort_xct(&self, worker: &mut Worker) -> Result<()> {
        if !worker.xct.is_active() {
            return Err(Error::XctNoXct);
        }
        worker.xct.deactivate();
        worker.log_buffer.discard_current_xct_log();
        Ok(())
    }

    /// Prepares the running transaction for commit. On success the commit
    /// epoch is returned through `commit_epoch`; the transaction is deemed
    /// committed once that epoch is durable. `XctRaceAbort` means the
    /// transaction was cleanly aborted and the caller should retry from
    /// begin. Either way the context is deactivated.
    pub fn precommit_xct(
        &self,
        engine: &'static Engine,
        worker: &mut Worker,
        commit_epoch: &mut Epoch,
    ) -> Result<()> {
        if !worker.xct.is_active() {
            return Err(Error::XctNoXct);
        }
        let read_only = worker.xct.is_read_only();
        let success = if read_only {
            self.precommit_xct_readonly(engine, worker, commit_epoch)
        } else {
            self.precommit_xct_readwrite(engine, worker, commit_epoch)
        };
        worker.xct.deactivate();
        if success {
            Ok(())
        } else {
            tracing::debug!(worker = worker.id(), "aborting because of contention");
            worker.log_buffer.discard_current_xct_log();
            Err(Error::XctRaceAbort)
        }
    }

    /// Read-only fast path: no locks, an acquire fence, then verification.
    fn precommit_xct_readonly(
        &self,
        engine: &Engine,
        worker: &mut Worker,
        commit_epoch: &mut Epoch,
    ) -> bool {
        debug_assert!(worker.log_buffer.offset_tail() == worker.log_buffer.offset_committed());
        *commit_epoch = Epoch::INVALID;
        fence(Ordering::Acquire);
        self.precommit_xct_verify_readonly(engine, worker, commit_epoch)
    }

    fn precommit_xct_readwrite(
        &self,
        engine: &'static Engine,
        worker: &mut Worker,
        commit_epoch: &mut Epoch,
    ) -> bool {
        let mut max_xct_id = XctId::new(INITIAL_DURABLE_EPOCH, 1);
        if !self.precommit_xct_lock(engine, worker, &mut max_xct_id) {
            // lock fails only when records moved beyond tracking reach
            return false;
        }

        // Before the first fence, advertise the in-commit epoch so loggers
        // hold the durable frontier below us until publish. The full fence
        // pairs with the logger's fence: either the logger sees our guard,
        // or our serialization-point load sees the advanced epoch.
        worker.set_in_commit_log_epoch(self.get_current_global_epoch_weak());
        fence(Ordering::SeqCst);

        *commit_epoch = self.get_current_global_epoch_weak(); // serialization point!

        fence(Ordering::AcqRel);
        let verified = self.precommit_xct_verify_readwrite(engine, worker, &mut max_xct_id);
        #[cfg(debug_assertions)]
        for access in &worker.xct.write_set {
            debug_assert!(access.owner.get().is_keylocked());
        }
        if verified {
            self.precommit_xct_apply(engine, worker, max_xct_id, *commit_epoch);
            // publish AFTER (with fence) apply: apply stamps the final
            // XctId into the log entries.
            fence(Ordering::Release);
            worker.log_buffer.publish_committed_log(*commit_epoch);
        } else {
            self.precommit_xct_unlock(worker);
        }
        worker.set_in_commit_log_epoch(Epoch::INVALID);
        verified
    }

    /// Commit Phase 1: track moved records, sort the write set by owner
    /// address, and acquire MCS key locks in that order. With multiple
    /// write-set entries on one record, only the last occurrence locks.
    fn precommit_xct_lock(
        &self,
        engine: &Engine,
        worker: &mut Worker,
        max_xct_id: &mut XctId,
    ) -> bool {
        loop {
            // moved-record pre-pass, before locking: lock-then-track would
            // deadlock.
            for i in 0..worker.xct.write_set.len() {
                if worker.xct.write_set[i].owner.get().is_moved() {
                    let storage_id = worker.xct.write_set[i].storage_id;
                    let tracked = engine
                        .storage_manager()
                        .track_moved_record(storage_id, &mut worker.xct.write_set[i]);
                    if !tracked {
                        // the record went too far away (eg another layer in
                        // masstree); the whole transaction retries.
                        self.precommit_xct_unlock(worker);
                        return false;
                    }
                }
            }

            worker
                .xct
                .write_set
                .sort_unstable_by_key(|w| w.owner.addr());

            let len = worker.xct.write_set.len();
            let mut needs_retry = false;
            for i in 0..len {
                debug_assert!(worker.xct.write_set[i].mcs_block == 0);
                let owner = worker.xct.write_set[i].owner;
                if i + 1 < len && owner == worker.xct.write_set[i + 1].owner {
                    // multiple write sets on one record: lock at the last one
                    continue;
                }
                let block = worker.mcs_acquire_lock(owner.get());
                worker.xct.write_set[i].mcs_block = block;
                if owner.get().is_moved() {
                    // moved-bit conflict after locking; this occasionally
                    // happens. Release everything and restart tracking.
                    self.precommit_xct_unlock(worker);
                    needs_retry = true;
                    break;
                }
                debug_assert!(owner.get().is_keylocked());
                max_xct_id.store_max(owner.get().xct_id());
            }
            if !needs_retry {
                return true;
            }
        }
    }

    fn precommit_xct_verify_readonly(
        &self,
        engine: &Engine,
        worker: &mut Worker,
        commit_epoch: &mut Epoch,
    ) -> bool {
        for i in 0..worker.xct.read_set.len() {
            let access = &worker.xct.read_set[i];
            if access.owner.get().is_moved() {
                let owner = engine
                    .storage_manager()
                    .track_moved_owner(access.storage_id, access.owner);
                worker.xct.read_set[i].owner = owner;
            }
            let access = &worker.xct.read_set[i];
            if access.observed != access.owner.get().xct_id() {
                return false;
            }
            // remembers the highest epoch observed.
            commit_epoch.store_max(access.observed.epoch());
        }
        if !commit_epoch.is_valid() {
            // no read set; conservatively take the already-durable epoch so
            // the caller has a valid epoch to wait on.
            *commit_epoch = engine.log_manager().get_durable_global_epoch_weak();
        }
        self.precommit_xct_verify_pointer_set(worker)
            && self.precommit_xct_verify_page_version_set(worker)
    }

    /// Commit Phase 2 verification for read-write transactions.
    fn precommit_xct_verify_readwrite(
        &self,
        engine: &Engine,
        worker: &mut Worker,
        max_xct_id: &mut XctId,
    ) -> bool {
        for i in 0..worker.xct.read_set.len() {
            // read sets also track moved records, but without a retry loop:
            // on the rare re-move we just abort.
            let access = &worker.xct.read_set[i];
            if access.owner.get().is_moved() {
                let owner = engine
                    .storage_manager()
                    .track_moved_owner(access.storage_id, access.owner);
                worker.xct.read_set[i].owner = owner;
            }
            let access = &worker.xct.read_set[i];
            // we don't check ordinal-only changes specially; any inequality
            // means another transaction owned the record since we read it.
            if access.observed != access.owner.get().xct_id() {
                return false;
            }
            max_xct_id.store_max(access.observed);
        }
        self.precommit_xct_verify_pointer_set(worker)
            && self.precommit_xct_verify_page_version_set(worker)
    }

    fn precommit_xct_verify_pointer_set(&self, worker: &Worker) -> bool {
        for access in &worker.xct.pointer_set {
            if access.address.get().load(Ordering::Acquire) != access.observed {
                return false;
            }
        }
        true
    }

    fn precommit_xct_verify_page_version_set(&self, worker: &Worker) -> bool {
        for access in &worker.xct.page_version_set {
            if access.address.get().observe() != access.observed {
                return false;
            }
        }
        true
    }

    /// Commit Phase 3: issue the new XctId, stamp and apply every log in
    /// sorted order, overwrite the owner words, and unlock.
    fn precommit_xct_apply(
        &self,
        engine: &'static Engine,
        worker: &mut Worker,
        max_xct_id: XctId,
        commit_epoch: Epoch,
    ) {
        worker.xct.issue_next_id(max_xct_id, commit_epoch);
        let new_xct_id = worker.xct.get_id().clear_status_bits();
        debug_assert!(new_xct_id.epoch() == commit_epoch);
        debug_assert!(new_xct_id.ordinal() > 0);
        // used if the record after apply is in deleted state.
        let new_deleted_xct_id = new_xct_id.with_status(XctStatus::DELETED);

        let len = worker.xct.write_set.len();
        for i in 0..len {
            let owner = worker.xct.write_set[i].owner;
            let payload = worker.xct.write_set[i].payload;
            let log_offset = worker.xct.write_set[i].log_offset;
            let mcs_block = worker.xct.write_set[i].mcs_block;
            debug_assert!(owner.get().is_keylocked());

            // data first, then owner, then unlock; fences in between.
            worker.log_buffer.stamp_record_xct_id(log_offset, new_xct_id);
            if i > 0 && owner == worker.xct.write_set[i - 1].owner {
                // the previous entry already set BEING_WRITTEN and kept the
                // lock.
                debug_assert!(owner.get().xct_id().is_being_written());
            } else {
                debug_assert!(!owner.get().xct_id().is_being_written());
                owner.get().set_status(XctStatus::BEING_WRITTEN);
                fence(Ordering::Release);
            }
            let record = worker.log_buffer.record_at(log_offset);
            if let Err(e) = engine.storage_manager().invoke_apply_record(
                engine,
                record,
                Some(owner),
                Some(payload),
            ) {
                // record applies are infallible by construction; anything
                // else here is an engine bug.
                tracing::error!(error = %e, "apply_record failed in commit apply");
                debug_assert!(false, "apply_record failed: {e}");
            }
            let owner_now = owner.get().xct_id();
            debug_assert!(!owner_now.is_valid() || owner_now.before(new_xct_id));
            if i + 1 < len && owner == worker.xct.write_set[i + 1].owner {
                // keep the lock for the next write set on the same record
                debug_assert!(mcs_block == 0);
            } else {
                debug_assert!(mcs_block != 0);
                fence(Ordering::Release);
                if owner.get().xct_id().is_deleted() {
                    // preserve the delete-flag set by a delete operation
                    owner.get().set_xct_id(new_deleted_xct_id);
                } else {
                    owner.get().set_xct_id(new_xct_id);
                }
                worker.mcs_release_lock(owner.get(), mcs_block);
                worker.xct.write_set[i].mcs_block = 0;
            }
        }

        // lock-free write set: no owner word, no lock, no ordering concern.
        for i in 0..worker.xct.lock_free_write_set.len() {
            let log_offset = worker.xct.lock_free_write_set[i].log_offset;
            worker.log_buffer.stamp_record_xct_id(log_offset, new_xct_id);
            let record = worker.log_buffer.record_at(log_offset);
            if let Err(e) = engine
                .storage_manager()
                .invoke_apply_record(engine, record, None, None)
            {
                tracing::error!(error = %e, "lock-free apply_record failed");
                debug_assert!(false, "lock-free apply_record failed: {e}");
            }
        }
    }

    /// Releases every lock the write set holds, without applying. Called on
    /// verification failure and from the lock phase's retry path.
    fn precommit_xct_unlock(&self, worker: &mut Worker) {
        fence(Ordering::Release);
        for i in 0..worker.xct.write_set.len() {
            let owner = worker.xct.write_set[i].owner;
            let block = worker.xct.write_set[i].mcs_block;
            if block != 0 {
                debug_assert!(owner.get().is_keylocked());
                worker.mcs_release_lock(owner.get(), block);
                worker.xct.write_set[i].mcs_block = 0;
            }
        }
        fence(Ordering::Release);
    }
}

impl Default for XctManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::array::{leaf_capacity, record_size};
    use crate::storage::StorageMetadata;
    use crate::test_support::tiny_engine;
    use crate::xct::xct_id::LockableXctId;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::Arc as StdArc;

    /// Owner word of one array record, for lock/moved-bit assertions.
    fn record_owner(engine: &Engine, storage_id: u32, offset: u64) -> &'static LockableXctId {
        let cb = engine.storage_manager().get_storage(storage_id).unwrap();
        let payload_size = match cb.meta.spec {
            crate::storage::StorageSpec::Array { payload_size, .. } => payload_size,
            _ => panic!("not an array"),
        };
        let capacity = leaf_capacity(payload_size) as u64;
        // SAFETY: volatile pages stay mapped for the engine lifetime.
        let root: &'static crate::storage::page::Page = unsafe {
            &*engine
                .page_pools()
                .resolve(cb.root_page_pointer.volatile_ptr())
        };
        let child = root.interior_child((offset / capacity) as usize);
        let leaf: &'static crate::storage::page::Page =
            unsafe { &*engine.page_pools().resolve(child.volatile_ptr()) };
        leaf.leaf_record_owner((offset % capacity) as usize, record_size(payload_size))
    }

    #[test]
    fn test_begin_twice_fails() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        let err = engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap_err();
        assert!(matches!(err, Error::XctAlreadyRunning));
        engine.xct_manager().abort_xct(&mut worker).unwrap();
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_abort_without_xct_fails() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let err = engine.xct_manager().abort_xct(&mut worker).unwrap_err();
        assert!(matches!(err, Error::XctNoXct));
        let mut epoch = Epoch::INVALID;
        let err = engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap_err();
        assert!(matches!(err, Error::XctNoXct));
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_readonly_empty_commits_at_durable_epoch() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        let mut epoch = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap();
        assert!(epoch.is_valid());
        // already durable: waiting must return immediately.
        engine
            .xct_manager()
            .wait_for_commit(engine, epoch, 0)
            .unwrap();
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_commit_and_no_lost_writes() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, create_epoch) = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::array("a", 8, 16))
            .unwrap();
        assert!(create_epoch.is_valid());
        let array = worker.array(id).unwrap();

        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        array.overwrite(&mut worker, 3, &7u64.to_le_bytes()).unwrap();
        let mut commit_epoch = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut commit_epoch)
            .unwrap();
        assert!(commit_epoch.is_valid());
        // every write-set lock is released after commit
        assert!(!record_owner(engine, id, 3).is_keylocked());

        engine
            .xct_manager()
            .wait_for_commit(engine, commit_epoch, -1)
            .unwrap();

        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        let mut buf = [0u8; 8];
        array.get(&mut worker, 3, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);
        let mut epoch = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap();
        // the reader observed the committed id, so its commit epoch is at
        // least the writer's.
        assert!(epoch == commit_epoch || commit_epoch.before(epoch));
        drop(array);
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_read_set_invalidation_aborts() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut a = engine.new_worker().unwrap();
        let mut b = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(engine, &mut a, StorageMetadata::array("r", 8, 4))
            .unwrap();
        let array_a = a.array(id).unwrap();
        let array_b = b.array(id).unwrap();

        // A reads R
        engine
            .xct_manager()
            .begin_xct(&mut a, IsolationLevel::Serializable)
            .unwrap();
        let mut buf = [0u8; 8];
        array_a.get(&mut a, 0, &mut buf).unwrap();

        // B commits a write on R
        engine
            .xct_manager()
            .begin_xct(&mut b, IsolationLevel::Serializable)
            .unwrap();
        array_b.overwrite(&mut b, 0, &1u64.to_le_bytes()).unwrap();
        let mut epoch_b = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut b, &mut epoch_b)
            .unwrap();

        // A (still active) writes elsewhere and precommits; its read of R
        // must fail verification
        array_a.overwrite(&mut a, 1, &2u64.to_le_bytes()).unwrap();
        let mut epoch_a = Epoch::INVALID;
        let err = engine
            .xct_manager()
            .precommit_xct(engine, &mut a, &mut epoch_a)
            .unwrap_err();
        assert!(matches!(err, Error::XctRaceAbort));
        // cleanly aborted: no locks left behind
        assert!(!record_owner(engine, id, 0).is_keylocked());
        assert!(!record_owner(engine, id, 1).is_keylocked());
        drop(array_a);
        drop(array_b);
        drop(a);
        drop(b);
        t.teardown();
    }

    #[test]
    fn test_moved_record_aborts_cleanly() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::array("m", 8, 8))
            .unwrap();
        let array = worker.array(id).unwrap();

        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        array.overwrite(&mut worker, 0, &9u64.to_le_bytes()).unwrap();
        // the record migrates under the running transaction
        record_owner(engine, id, 0).set_status(XctStatus::MOVED);
        let mut epoch = Epoch::INVALID;
        let err = engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap_err();
        // array records have no forwarding; tracking fails and the
        // transaction aborts with every lock released.
        assert!(matches!(err, Error::XctRaceAbort));
        assert!(!record_owner(engine, id, 0).is_keylocked());
        // the moved bit is one-way
        assert!(record_owner(engine, id, 0).is_moved());

        // an untouched record still commits
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        array.overwrite(&mut worker, 1, &1u64.to_le_bytes()).unwrap();
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap();
        drop(array);
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_pointer_and_page_version_verification() {
        use crate::xct::{PageVersionPtr, WordPtr};
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::array("v", 8, 4))
            .unwrap();
        let cb = engine.storage_manager().get_storage(id).unwrap();
        let root: &'static crate::storage::page::Page = unsafe {
            &*engine
                .page_pools()
                .resolve(cb.root_page_pointer.volatile_ptr())
        };

        // matching observations commit
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        let word = cb.root_page_pointer.volatile_word();
        worker
            .xct
            .add_to_pointer_set(WordPtr::new(word), word.load(Ordering::Relaxed));
        worker
            .xct
            .add_to_page_version_set(PageVersionPtr::new(root.version()), root.version().observe());
        let mut epoch = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap();

        // a concurrent page-version change fails verification
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        worker
            .xct
            .add_to_page_version_set(PageVersionPtr::new(root.version()), root.version().observe());
        root.version().bump();
        let err = engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap_err();
        assert!(matches!(err, Error::XctRaceAbort));

        // a replaced pointer word fails verification
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        worker
            .xct
            .add_to_pointer_set(WordPtr::new(word), word.load(Ordering::Relaxed) + 1);
        let err = engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap_err();
        assert!(matches!(err, Error::XctRaceAbort));
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_wait_for_commit_timeout() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let far = Epoch::new(engine.xct_manager().get_current_global_epoch().value() + 100_000);
        let err = engine
            .xct_manager()
            .wait_for_commit(engine, far, 0)
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        let err = engine
            .xct_manager()
            .wait_for_commit(engine, far, 2_000)
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        t.teardown();
    }

    #[test]
    fn test_concurrent_increments_are_serializable() {
        const THREADS: usize = 4;
        const INCREMENTS: usize = 50;
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut setup = engine.new_worker().unwrap();
        let (id, epoch) = engine
            .storage_manager()
            .create_storage(engine, &mut setup, StorageMetadata::array("ctr", 8, 2))
            .unwrap();
        engine.xct_manager().wait_for_commit(engine, epoch, -1).unwrap();
        drop(setup);

        let aborts = StdArc::new(StdAtomicU64::new(0));
        let mut handles = vec![];
        for _ in 0..THREADS {
            let aborts = StdArc::clone(&aborts);
            handles.push(std::thread::spawn(move || {
                let mut worker = engine.new_worker().unwrap();
                let array = worker.array(id).unwrap();
                for _ in 0..INCREMENTS {
                    // read-modify-write with retry on race aborts
                    loop {
                        engine
                            .xct_manager()
                            .begin_xct(&mut worker, IsolationLevel::Serializable)
                            .unwrap();
                        let mut buf = [0u8; 8];
                        array.get(&mut worker, 0, &mut buf).unwrap();
                        let next = u64::from_le_bytes(buf) + 1;
                        array.overwrite(&mut worker, 0, &next.to_le_bytes()).unwrap();
                        let mut epoch = Epoch::INVALID;
                        match engine.xct_manager().precommit_xct(engine, &mut worker, &mut epoch)
                        {
                            Ok(()) => break,
                            Err(Error::XctRaceAbort) => {
                                aborts.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut worker = engine.new_worker().unwrap();
        let array = worker.array(id).unwrap();
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        let mut buf = [0u8; 8];
        array.get(&mut worker, 0, &mut buf).unwrap();
        // serializable increments: none lost
        assert_eq!(u64::from_le_bytes(buf) as usize, THREADS * INCREMENTS);
        engine.xct_manager().abort_xct(&mut worker).unwrap();
        drop(array);
        drop(worker);
        t.teardown();
    }
}
