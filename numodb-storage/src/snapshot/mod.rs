//! Snapshotting: the manager thread, the metadata document, and the
//! per-node snapshot page stores.
//!
//! A snapshot run converts the durable log stream into immutable snapshot
//! pages via the gleaner pipeline and finishes by writing a metadata file
//! describing every storage covered by the snapshot.
pub mod gleaner;
mod mapper;
mod reducer;

use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::error::{Error, Result};
use crate::storage::page::{Page, SnapshotPagePointer};
use crate::storage::{StorageId, StorageMetadata};
use crate::thread;
use byte_unit::Byte;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread::JoinHandle;

pub type SnapshotId = u16;
pub const NULL_SNAPSHOT_ID: SnapshotId = 0;

pub const DEFAULT_SNAPSHOT_FOLDER: &str = "snapshots";
pub const DEFAULT_NONRECORD_LOG_BUFFER_SIZE: Byte = Byte::from_u64(1 << 21);
pub const DEFAULT_REDUCER_BUFFER_SIZE: Byte = Byte::from_u64(1 << 20);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Folder for snapshot metadata files and reducer spill runs.
    pub folder_path: String,
    /// Size of the gleaner's interleaved buffer for storage-level logs.
    pub nonrecord_log_buffer_size: Byte,
    /// In-memory sort budget of one reducer before it spills a run.
    pub reducer_buffer_size: Byte,
}

impl SnapshotConfig {
    #[inline]
    pub fn folder_path(mut self, path: impl Into<String>) -> Self {
        self.folder_path = path.into();
        self
    }

    #[inline]
    pub fn nonrecord_log_buffer_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.nonrecord_log_buffer_size = Byte::from(size);
        self
    }

    #[inline]
    pub fn reducer_buffer_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.reducer_buffer_size = Byte::from(size);
        self
    }
}

impl Default for SnapshotConfig {
    #[inline]
    fn default() -> Self {
        SnapshotConfig {
            folder_path: String::from(DEFAULT_SNAPSHOT_FOLDER),
            nonrecord_log_buffer_size: DEFAULT_NONRECORD_LOG_BUFFER_SIZE,
            reducer_buffer_size: DEFAULT_REDUCER_BUFFER_SIZE,
        }
    }
}

/// The metadata document written at the end of a snapshot run.
///
/// `valid_until_epoch` is at least every commit epoch reported to a worker
/// before the snapshot was triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub id: SnapshotId,
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    pub largest_storage_id: StorageId,
    pub storages: Vec<StorageMetadata>,
}

impl SnapshotMetadata {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<SnapshotMetadata> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Metadata entry of one storage, if the snapshot covers it.
    pub fn get_metadata(&self, id: StorageId) -> Option<&StorageMetadata> {
        self.storages.iter().find(|m| m.id == id)
    }
}

/// Per-node store of immutable snapshot pages, addressed by
/// [`SnapshotPagePointer`] offsets (1-based; 0 is null).
pub struct SnapshotPageStore {
    node: u16,
    pages: Mutex<Vec<Box<Page>>>,
}

impl SnapshotPageStore {
    fn new(node: u16) -> SnapshotPageStore {
        SnapshotPageStore {
            node,
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Adds an immutable page, returning its pointer.
    pub fn append(&self, page: Box<Page>, snapshot_id: SnapshotId) -> SnapshotPagePointer {
        let mut g = self.pages.lock();
        g.push(page);
        SnapshotPagePointer::new(self.node, snapshot_id, g.len() as u32)
    }

    pub fn resolve(&self, offset: u32) -> Result<*const Page> {
        let g = self.pages.lock();
        // boxed pages have stable addresses; the pointer outlives the lock.
        g.get(offset as usize - 1)
            .map(|p| &**p as *const Page)
            .ok_or(Error::InvalidArgument)
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SnapshotCtl {
    stop: bool,
    /// Monotone trigger counter; each trigger schedules one run.
    trigger_seq: u64,
    completed_seq: u64,
    last_error: Option<Error>,
}

pub struct SnapshotManager {
    initialized: AtomicBool,
    config: SnapshotConfig,
    previous_snapshot_id: AtomicU16,
    previous_valid_until: AtomicEpoch,
    page_stores: Box<[SnapshotPageStore]>,
    ctl: Mutex<SnapshotCtl>,
    trigger_cv: Condvar,
    done_cv: Condvar,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotManager {
    pub fn new(config: &SnapshotConfig, nodes: u16) -> Result<SnapshotManager> {
        let page_stores = (0..nodes).map(SnapshotPageStore::new).collect();
        Ok(SnapshotManager {
            initialized: AtomicBool::new(false),
            config: config.clone(),
            previous_snapshot_id: AtomicU16::new(NULL_SNAPSHOT_ID),
            previous_valid_until: AtomicEpoch::new(Epoch::INVALID),
            page_stores,
            ctl: Mutex::new(SnapshotCtl {
                stop: false,
                trigger_seq: 0,
                completed_seq: 0,
                last_error: None,
            }),
            trigger_cv: Condvar::new(),
            done_cv: Condvar::new(),
            driver: Mutex::new(None),
        })
    }

    pub fn initialize(&'static self, engine: &'static Engine) -> Result<()> {
        tracing::info!(folder = %self.config.folder_path, "initializing SnapshotManager");
        std::fs::create_dir_all(&self.config.folder_path)?;
        self.ctl.lock().stop = false;
        *self.driver.lock() = Some(thread::spawn_named("snapshot-manager", move || {
            self.snapshot_loop(engine)
        }));
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn uninitialize(&self) -> Result<()> {
        tracing::info!("uninitializing SnapshotManager");
        {
            let mut g = self.ctl.lock();
            g.stop = true;
            self.trigger_cv.notify_all();
            self.done_cv.notify_all();
        }
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    #[inline]
    pub fn get_previous_snapshot_id(&self) -> SnapshotId {
        self.previous_snapshot_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn page_store(&self, node: u16) -> &SnapshotPageStore {
        &self.page_stores[node as usize]
    }

    pub fn resolve_page(&self, ptr: SnapshotPagePointer) -> Result<*const Page> {
        if ptr.is_null() {
            return Err(Error::InvalidArgument);
        }
        self.page_stores
            .get(ptr.numa_node() as usize)
            .ok_or(Error::InvalidArgument)?
            .resolve(ptr.offset())
    }

    pub fn snapshot_metadata_file_path(&self, id: SnapshotId) -> PathBuf {
        Path::new(&self.config.folder_path).join(format!("snapshot_metadata_{id}.json"))
    }

    /// Schedules a snapshot run; with `wait` blocks until it completes and
    /// propagates its error, if any.
    pub fn trigger_snapshot_immediate(&self, wait: bool) -> Result<()> {
        let target = {
            let mut g = self.ctl.lock();
            g.trigger_seq += 1;
            self.trigger_cv.notify_all();
            g.trigger_seq
        };
        if !wait {
            return Ok(());
        }
        let mut g = self.ctl.lock();
        while g.completed_seq < target && !g.stop {
            self.done_cv.wait(&mut g);
        }
        if g.completed_seq < target {
            return Err(Error::TimedOut); // stopped before the run happened
        }
        match &g.last_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn snapshot_loop(&self, engine: &'static Engine) {
        loop {
            let target = {
                let mut g = self.ctl.lock();
                while !g.stop && g.completed_seq >= g.trigger_seq {
                    self.trigger_cv.wait(&mut g);
                }
                if g.stop {
                    return;
                }
                g.trigger_seq
            };
            let result = self.handle_snapshot(engine);
            if let Err(e) = &result {
                tracing::error!(error = %e, "snapshot run failed");
            }
            let mut g = self.ctl.lock();
            g.completed_seq = target;
            g.last_error = result.err();
            self.done_cv.notify_all();
        }
    }

    /// One snapshot run: make the pre-trigger epoch durable, glean the
    /// durable stream, and write the metadata file.
    fn handle_snapshot(&self, engine: &'static Engine) -> Result<()> {
        let pre_trigger_epoch = engine.xct_manager().get_current_global_epoch();
        engine.xct_manager().advance_current_global_epoch();
        engine
            .xct_manager()
            .wait_for_commit(engine, pre_trigger_epoch, -1)?;

        let valid_until = engine.log_manager().get_durable_global_epoch();
        let base_epoch = self.previous_valid_until.load(Ordering::Acquire);
        let mut id = self.get_previous_snapshot_id().wrapping_add(1);
        if id == NULL_SNAPSHOT_ID {
            id = 1;
        }
        tracing::info!(id, %base_epoch, %valid_until, "snapshot run starting");

        let gleaner = gleaner::LogGleaner::new(engine, id, base_epoch, valid_until);
        gleaner.execute()?;

        let metadata = SnapshotMetadata {
            id,
            base_epoch,
            valid_until_epoch: valid_until,
            largest_storage_id: engine.storage_manager().largest_storage_id(),
            storages: engine.storage_manager().clone_all_storage_metadata(),
        };
        metadata.save_to_file(self.snapshot_metadata_file_path(id))?;

        self.previous_valid_until.store(valid_until, Ordering::Release);
        self.previous_snapshot_id.store(id, Ordering::Release);
        tracing::info!(id, "snapshot run complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tiny_engine;
    use crate::xct::IsolationLevel;

    fn read_metadata(engine: &Engine) -> SnapshotMetadata {
        let manager = engine.snapshot_manager();
        let id = manager.get_previous_snapshot_id();
        assert_ne!(id, NULL_SNAPSHOT_ID);
        SnapshotMetadata::load_from_file(manager.snapshot_metadata_file_path(id)).unwrap()
    }

    #[test]
    fn test_snapshot_empty() {
        let t = tiny_engine(1);
        let engine = t.engine;
        engine
            .snapshot_manager()
            .trigger_snapshot_immediate(true)
            .unwrap();

        let metadata = read_metadata(engine);
        assert_eq!(metadata.id, engine.snapshot_manager().get_previous_snapshot_id());
        assert!(!metadata.base_epoch.is_valid());
        assert!(metadata.valid_until_epoch.is_valid());
        assert_eq!(metadata.largest_storage_id, 0);
        assert!(metadata.storages.is_empty());
        t.teardown();
    }

    #[test]
    fn test_snapshot_one_array_create() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, commit_epoch) = engine
            .storage_manager()
            .create_storage(
                engine,
                &mut worker,
                crate::storage::StorageMetadata::array("test", 16, 100),
            )
            .unwrap();
        let array = worker.array(id).unwrap();
        assert!(array.exists());
        assert!(commit_epoch.is_valid());
        engine
            .xct_manager()
            .wait_for_commit(engine, commit_epoch, -1)
            .unwrap();
        engine
            .snapshot_manager()
            .trigger_snapshot_immediate(true)
            .unwrap();

        let metadata = read_metadata(engine);
        assert_eq!(metadata.id, engine.snapshot_manager().get_previous_snapshot_id());
        assert!(!metadata.base_epoch.is_valid());
        assert!(
            metadata.valid_until_epoch == commit_epoch
                || commit_epoch.before(metadata.valid_until_epoch)
        );
        assert_eq!(metadata.largest_storage_id, 1);

        let entry = metadata.get_metadata(array.id()).unwrap();
        assert_eq!(entry.id, array.id());
        assert_eq!(entry.name, "test");
        assert_eq!(entry.kind, crate::storage::StorageKind::Array);
        assert_eq!(
            entry.spec,
            crate::storage::StorageSpec::Array {
                payload_size: 16,
                array_size: 100
            }
        );
        drop(array);
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_snapshot_two_array_create() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id1, _) = engine
            .storage_manager()
            .create_storage(
                engine,
                &mut worker,
                crate::storage::StorageMetadata::array("test", 16, 10),
            )
            .unwrap();
        let (id2, commit_epoch) = engine
            .storage_manager()
            .create_storage(
                engine,
                &mut worker,
                crate::storage::StorageMetadata::array("test2", 50, 20),
            )
            .unwrap();
        assert!(commit_epoch.is_valid());
        engine
            .xct_manager()
            .wait_for_commit(engine, commit_epoch, -1)
            .unwrap();
        engine
            .snapshot_manager()
            .trigger_snapshot_immediate(true)
            .unwrap();

        let metadata = read_metadata(engine);
        assert!(!metadata.base_epoch.is_valid());
        assert!(
            metadata.valid_until_epoch == commit_epoch
                || commit_epoch.before(metadata.valid_until_epoch)
        );
        assert_eq!(metadata.largest_storage_id, 2);

        let entry = metadata.get_metadata(id1).unwrap();
        assert_eq!(entry.name, "test");
        assert_eq!(
            entry.spec,
            crate::storage::StorageSpec::Array {
                payload_size: 16,
                array_size: 10
            }
        );
        let entry = metadata.get_metadata(id2).unwrap();
        assert_eq!(entry.name, "test2");
        assert_eq!(
            entry.spec,
            crate::storage::StorageSpec::Array {
                payload_size: 50,
                array_size: 20
            }
        );
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_snapshot_materializes_array_pages() {
        let t = tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(
                engine,
                &mut worker,
                crate::storage::StorageMetadata::array("data", 8, 64),
            )
            .unwrap();
        let array = worker.array(id).unwrap();
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        for offset in [0u64, 5, 9] {
            array
                .overwrite(&mut worker, offset, &(offset * 100).to_le_bytes())
                .unwrap();
        }
        let mut commit_epoch = Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut commit_epoch)
            .unwrap();
        engine
            .xct_manager()
            .wait_for_commit(engine, commit_epoch, -1)
            .unwrap();
        engine
            .snapshot_manager()
            .trigger_snapshot_immediate(true)
            .unwrap();

        // the gleaner emitted pages and installed a snapshot root
        assert!(!engine.snapshot_manager().page_store(0).is_empty());
        let cb = engine.storage_manager().get_storage(id).unwrap();
        assert!(!cb.root_page_pointer.snapshot_ptr().is_null());

        // a snapshot-isolation read resolves through the snapshot pages
        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Snapshot)
            .unwrap();
        let mut buf = [0u8; 8];
        array.get(&mut worker, 5, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 500);
        engine.xct_manager().abort_xct(&mut worker).unwrap();
        drop(array);
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_metadata_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot_metadata_1.json");
        let metadata = SnapshotMetadata {
            id: 1,
            base_epoch: Epoch::INVALID,
            valid_until_epoch: Epoch::new(9),
            largest_storage_id: 2,
            storages: vec![
                StorageMetadata::array("test", 16, 100),
                StorageMetadata::sequential("log"),
            ],
        };
        metadata.save_to_file(&path).unwrap();
        let back = SnapshotMetadata::load_from_file(&path).unwrap();
        assert_eq!(back.id, 1);
        assert!(!back.base_epoch.is_valid());
        assert_eq!(back.valid_until_epoch, Epoch::new(9));
        assert_eq!(back.largest_storage_id, 2);
        assert_eq!(back.storages.len(), 2);
        assert_eq!(back.get_metadata(0).unwrap().name, "test");
    }

    #[test]
    fn test_page_store_addressing() {
        let store = SnapshotPageStore::new(2);
        assert!(store.is_empty());
        let ptr = store.append(Page::new_boxed_zeroed(), 1);
        assert_eq!(ptr.numa_node(), 2);
        assert_eq!(ptr.snapshot_id(), 1);
        assert_eq!(ptr.offset(), 1);
        assert!(store.resolve(1).is_ok());
        assert!(store.resolve(2).is_err());
    }
}
