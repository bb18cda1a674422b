//! Storage management: control blocks, metadata, create/drop lifecycle, and
//! the per-kind dispatch the commit core consumes (apply, moved-record
//! tracking).
pub mod array;
pub mod page;
pub mod partition;

use crate::engine::Engine;
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::log::record::{LogKind, LogRecord};
use crate::storage::page::DualPagePointer;
use crate::worker::Worker;
use crate::xct::{IsolationLevel, OwnerPtr, PayloadPtr, WriteXctAccess};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

pub type StorageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Array,
    Hash,
    Masstree,
    Sequential,
}

/// Kind-specific metadata fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageSpec {
    Array { payload_size: u16, array_size: u64 },
    Hash { bin_bits: u8 },
    Masstree {},
    Sequential {},
}

impl StorageSpec {
    #[inline]
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageSpec::Array { .. } => StorageKind::Array,
            StorageSpec::Hash { .. } => StorageKind::Hash,
            StorageSpec::Masstree {} => StorageKind::Masstree,
            StorageSpec::Sequential {} => StorageKind::Sequential,
        }
    }
}

pub const MAX_ENTRIES_PER_BIN: u64 = 23;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub id: StorageId,
    pub name: String,
    pub kind: StorageKind,
    pub spec: StorageSpec,
}

impl StorageMetadata {
    pub fn array(name: impl Into<String>, payload_size: u16, array_size: u64) -> StorageMetadata {
        StorageMetadata {
            id: 0,
            name: name.into(),
            kind: StorageKind::Array,
            spec: StorageSpec::Array {
                payload_size,
                array_size,
            },
        }
    }

    pub fn hash(name: impl Into<String>, bin_bits: u8) -> StorageMetadata {
        StorageMetadata {
            id: 0,
            name: name.into(),
            kind: StorageKind::Hash,
            spec: StorageSpec::Hash { bin_bits },
        }
    }

    /// Hash metadata sized for the expected record count at the preferred
    /// fill factor. Bin bits are clamped to [8, 63].
    pub fn hash_with_capacity(
        name: impl Into<String>,
        expected_records: u64,
        preferred_fill_factor: f64,
    ) -> StorageMetadata {
        let expected = expected_records.max(1);
        let fill = preferred_fill_factor.clamp(0.1, 1.0);
        let bin_count = (expected as f64 / fill / MAX_ENTRIES_PER_BIN as f64) as u64;
        let mut bits: u8 = 0;
        while bits < 63 && (1u64 << bits) < bin_count {
            bits += 1;
        }
        Self::hash(name, bits.max(8))
    }

    pub fn masstree(name: impl Into<String>) -> StorageMetadata {
        StorageMetadata {
            id: 0,
            name: name.into(),
            kind: StorageKind::Masstree,
            spec: StorageSpec::Masstree {},
        }
    }

    pub fn sequential(name: impl Into<String>) -> StorageMetadata {
        StorageMetadata {
            id: 0,
            name: name.into(),
            kind: StorageKind::Sequential,
            spec: StorageSpec::Sequential {},
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageStatus {
    NotCreated = 0,
    Exists = 1,
    MarkedForDeath = 2,
}

/// Shared-memory resident per-storage state.
pub struct StorageControlBlock {
    pub meta: StorageMetadata,
    status: AtomicU8,
    pub root_page_pointer: DualPagePointer,
    /// Volatile state of a sequential storage: an append-only list.
    /// Mutations come only from lock-free write-set applies.
    pub sequential_tail: Mutex<Vec<Vec<u8>>>,
}

impl StorageControlBlock {
    fn new(meta: StorageMetadata) -> StorageControlBlock {
        StorageControlBlock {
            meta,
            status: AtomicU8::new(StorageStatus::NotCreated as u8),
            root_page_pointer: DualPagePointer::new(),
            sequential_tail: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn status(&self) -> StorageStatus {
        match self.status.load(Ordering::Acquire) {
            1 => StorageStatus::Exists,
            2 => StorageStatus::MarkedForDeath,
            _ => StorageStatus::NotCreated,
        }
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.status() == StorageStatus::Exists
    }

    #[inline]
    fn set_status(&self, status: StorageStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Maps StorageId to control blocks and owns the storage lifecycle, which is
/// linearized by create/drop logs every worker observes on apply.
pub struct StorageManager {
    initialized: AtomicBool,
    next_storage_id: AtomicU32,
    registry: RwLock<HashMap<StorageId, Arc<StorageControlBlock>>>,
    by_name: Mutex<HashMap<String, StorageId>>,
    /// Serializes storage creation so name uniqueness checks are stable.
    create_mutex: Mutex<()>,
}

impl StorageManager {
    pub fn new() -> StorageManager {
        StorageManager {
            initialized: AtomicBool::new(false),
            next_storage_id: AtomicU32::new(1),
            registry: RwLock::new(HashMap::new()),
            by_name: Mutex::new(HashMap::new()),
            create_mutex: Mutex::new(()),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        tracing::info!("initializing StorageManager");
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn uninitialize(&self) -> Result<()> {
        tracing::info!("uninitializing StorageManager");
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Issues a unique, monotonically increasing storage id. The caller
    /// might later fail, so ids may have holes.
    #[inline]
    pub fn issue_next_storage_id(&self) -> StorageId {
        self.next_storage_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Largest id issued so far; 0 when no storage was ever created.
    #[inline]
    pub fn largest_storage_id(&self) -> StorageId {
        self.next_storage_id.load(Ordering::SeqCst) - 1
    }

    pub fn get_storage(&self, id: StorageId) -> Result<Arc<StorageControlBlock>> {
        self.registry
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidStorageId)
    }

    pub fn storage_id_by_name(&self, name: &str) -> Option<StorageId> {
        self.by_name.lock().get(name).copied()
    }

    pub fn get_array(&self, engine: &'static Engine, id: StorageId) -> Result<array::ArrayStorage> {
        let cb = self.get_storage(id)?;
        if cb.meta.kind != StorageKind::Array {
            return Err(Error::InvalidStorageId);
        }
        Ok(array::ArrayStorage::new(engine, cb))
    }

    /// Creates a storage through the ordinary commit protocol: the metadata
    /// is logged as a storage-level (lock-free) record and applied at
    /// commit, so every worker observes creations in commit order. Returns
    /// the assigned id and the commit epoch.
    pub fn create_storage(
        &self,
        engine: &'static Engine,
        worker: &mut Worker,
        mut meta: StorageMetadata,
    ) -> Result<(StorageId, Epoch)> {
        if meta.name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if let StorageSpec::Hash { bin_bits } = meta.spec {
            if !(8..=63).contains(&bin_bits) {
                return Err(Error::InvalidArgument);
            }
        }
        debug_assert!(meta.kind == meta.spec.kind());
        let _create_g = self.create_mutex.lock();
        if self.by_name.lock().contains_key(&meta.name) {
            return Err(Error::StorageNameExists);
        }
        let id = self.issue_next_storage_id();
        meta.id = id;
        tracing::info!(id, name = %meta.name, kind = ?meta.kind, "creating storage");

        engine.xct_manager().begin_xct(worker, IsolationLevel::Serializable)?;
        let json = serde_json::to_vec(&meta)?;
        let offset = match worker.log_buffer.append_record(LogKind::CreateStorage, id, &[&json]) {
            Ok(offset) => offset,
            Err(e) => {
                engine.xct_manager().abort_xct(worker)?;
                return Err(e);
            }
        };
        worker.xct.add_to_lock_free_write_set(id, offset);
        let mut commit_epoch = Epoch::INVALID;
        engine.xct_manager().precommit_xct(engine, worker, &mut commit_epoch)?;
        Ok((id, commit_epoch))
    }

    /// Removes a storage. Logs a warning and reports an invalid epoch for an
    /// unknown id instead of failing, so the operation can be retried.
    pub fn drop_storage(
        &self,
        engine: &'static Engine,
        worker: &mut Worker,
        id: StorageId,
    ) -> Result<Epoch> {
        if self.get_storage(id).is_err() {
            tracing::warn!(id, "drop_storage on unknown storage id");
            return Ok(Epoch::INVALID);
        }
        tracing::info!(id, "dropping storage");
        engine.xct_manager().begin_xct(worker, IsolationLevel::Serializable)?;
        let offset = match worker.log_buffer.append_record(LogKind::DropStorage, id, &[]) {
            Ok(offset) => offset,
            Err(e) => {
                engine.xct_manager().abort_xct(worker)?;
                return Err(e);
            }
        };
        worker.xct.add_to_lock_free_write_set(id, offset);
        let mut commit_epoch = Epoch::INVALID;
        engine.xct_manager().precommit_xct(engine, worker, &mut commit_epoch)?;
        Ok(commit_epoch)
    }

    /// Applies a CREATE STORAGE log: builds the control block and, for array
    /// storages, the eager volatile page tree.
    pub fn create_storage_apply(&self, engine: &Engine, meta: StorageMetadata) -> Result<()> {
        let cb = Arc::new(StorageControlBlock::new(meta));
        if cb.meta.kind == StorageKind::Array {
            array::create_volatile_tree(engine, &cb)?;
        }
        cb.set_status(StorageStatus::Exists);
        let id = cb.meta.id;
        let name = cb.meta.name.clone();
        self.registry.write().insert(id, cb);
        self.by_name.lock().insert(name, id);
        Ok(())
    }

    /// Applies a DROP STORAGE log: marks the block for death and releases
    /// its volatile pages.
    pub fn drop_storage_apply(&self, engine: &Engine, id: StorageId) {
        let cb = match self.registry.write().remove(&id) {
            Some(cb) => cb,
            None => {
                tracing::warn!(id, "drop_storage_apply on unknown storage id");
                return;
            }
        };
        cb.set_status(StorageStatus::MarkedForDeath);
        self.by_name.lock().remove(&cb.meta.name);
        if cb.meta.kind == StorageKind::Array {
            array::release_pages_recursive(engine, &cb);
        }
    }

    /// Resolves a "moved" record for a write-set entry, rewriting its owner
    /// and payload addresses to the record's new home. Returns false when
    /// the record went beyond tracking reach, which aborts the transaction.
    pub fn track_moved_record(&self, storage_id: StorageId, _write: &mut WriteXctAccess) -> bool {
        let kind = match self.get_storage(storage_id) {
            Ok(cb) => cb.meta.kind,
            Err(_) => return false,
        };
        match kind {
            // array and sequential records have fixed homes and never move.
            StorageKind::Array | StorageKind::Sequential => false,
            StorageKind::Hash | StorageKind::Masstree => {
                tracing::warn!(
                    storage_id,
                    "moved-record tracking requested for a storage kind whose page layout \
                     is not linked in"
                );
                false
            }
        }
    }

    /// Owner-only overload for read-set resolution. Returns the (possibly
    /// rewritten) owner address.
    pub fn track_moved_owner(&self, storage_id: StorageId, owner: OwnerPtr) -> OwnerPtr {
        let _ = storage_id;
        owner
    }

    /// Dispatches a log record to its storage-kind apply routine.
    ///
    /// Record applies (overwrite, append) are infallible; a storage-log
    /// apply can only fail on resource exhaustion, which is engine-fatal.
    pub fn invoke_apply_record(
        &self,
        engine: &Engine,
        record: &[u8],
        owner: Option<OwnerPtr>,
        payload: Option<PayloadPtr>,
    ) -> Result<()> {
        let record = LogRecord::parse(record).ok_or(Error::InvalidArgument)?;
        match record.kind() {
            LogKind::Filler => Ok(()),
            LogKind::ArrayOverwrite => {
                let cb = self.get_storage(record.storage_id())?;
                array::apply_overwrite(&cb, record, owner, payload);
                Ok(())
            }
            LogKind::SequentialAppend => {
                debug_assert!(owner.is_none() && payload.is_none());
                let cb = self.get_storage(record.storage_id())?;
                let bytes = record.payload();
                let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
                cb.sequential_tail.lock().push(bytes[4..4 + len].to_vec());
                Ok(())
            }
            LogKind::CreateStorage => {
                let meta: StorageMetadata = serde_json::from_slice(record.payload())?;
                self.create_storage_apply(engine, meta)
            }
            LogKind::DropStorage => {
                self.drop_storage_apply(engine, record.storage_id());
                Ok(())
            }
        }
    }

    /// Appends to a sequential storage within the running transaction. The
    /// record goes to the lock-free write set: no owner word, no locking.
    pub fn sequential_append(
        &self,
        worker: &mut Worker,
        id: StorageId,
        data: &[u8],
    ) -> Result<()> {
        if !worker.xct.is_active() {
            return Err(Error::XctNoXct);
        }
        let cb = self.get_storage(id)?;
        if cb.meta.kind != StorageKind::Sequential {
            return Err(Error::InvalidStorageId);
        }
        let len = (data.len() as u32).to_le_bytes();
        let offset =
            worker
                .log_buffer
                .append_record(LogKind::SequentialAppend, id, &[&len, data])?;
        worker.xct.add_to_lock_free_write_set(id, offset);
        Ok(())
    }

    /// Clones the metadata of all existing storages, ordered by id; used to
    /// build the snapshot metadata document.
    pub fn clone_all_storage_metadata(&self) -> Vec<StorageMetadata> {
        let mut out: Vec<StorageMetadata> = self
            .registry
            .read()
            .values()
            .filter(|cb| cb.exists())
            .map(|cb| cb.meta.clone())
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }
}

impl Default for StorageManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_round_trip() {
        let meta = StorageMetadata::array("test", 16, 100);
        let json = serde_json::to_vec(&meta).unwrap();
        let back: StorageMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(meta, back);
        assert_eq!(back.kind, StorageKind::Array);
        assert_eq!(
            back.spec,
            StorageSpec::Array {
                payload_size: 16,
                array_size: 100
            }
        );
    }

    #[test]
    fn test_hash_capacity_bounds() {
        // tiny table still gets the minimum 8 bits
        let meta = StorageMetadata::hash_with_capacity("h", 10, 0.5);
        match meta.spec {
            StorageSpec::Hash { bin_bits } => assert_eq!(bin_bits, 8),
            _ => panic!("wrong spec"),
        }
        // out-of-range fill factors are clamped, not rejected
        let meta = StorageMetadata::hash_with_capacity("h2", 1 << 20, 5.0);
        match meta.spec {
            StorageSpec::Hash { bin_bits } => assert!((8..=63).contains(&bin_bits)),
            _ => panic!("wrong spec"),
        }
        // more records need more bins
        let small = StorageMetadata::hash_with_capacity("a", 1 << 12, 0.5);
        let large = StorageMetadata::hash_with_capacity("b", 1 << 30, 0.5);
        let bits = |m: &StorageMetadata| match m.spec {
            StorageSpec::Hash { bin_bits } => bin_bits,
            _ => unreachable!(),
        };
        assert!(bits(&small) < bits(&large));
    }

    #[test]
    fn test_storage_id_issue_monotonic() {
        let mgr = StorageManager::new();
        assert_eq!(mgr.largest_storage_id(), 0);
        let a = mgr.issue_next_storage_id();
        let b = mgr.issue_next_storage_id();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(mgr.largest_storage_id(), 2);
    }

    #[test]
    fn test_control_block_status() {
        let cb = StorageControlBlock::new(StorageMetadata::sequential("s"));
        assert_eq!(cb.status(), StorageStatus::NotCreated);
        assert!(!cb.exists());
        cb.set_status(StorageStatus::Exists);
        assert!(cb.exists());
        cb.set_status(StorageStatus::MarkedForDeath);
        assert_eq!(cb.status(), StorageStatus::MarkedForDeath);
    }

    #[test]
    fn test_sequential_append_lock_free() {
        let t = crate::test_support::tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::sequential("audit"))
            .unwrap();

        engine
            .xct_manager()
            .begin_xct(&mut worker, IsolationLevel::Serializable)
            .unwrap();
        engine
            .storage_manager()
            .sequential_append(&mut worker, id, b"first")
            .unwrap();
        engine
            .storage_manager()
            .sequential_append(&mut worker, id, b"second record")
            .unwrap();
        let mut epoch = crate::epoch::Epoch::INVALID;
        engine
            .xct_manager()
            .precommit_xct(engine, &mut worker, &mut epoch)
            .unwrap();

        let cb = engine.storage_manager().get_storage(id).unwrap();
        let tail = cb.sequential_tail.lock();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], b"first");
        assert_eq!(tail[1], b"second record");
        drop(tail);
        drop(worker);
        t.teardown();
    }

    #[test]
    fn test_create_duplicate_name_and_drop() {
        let t = crate::test_support::tiny_engine(1);
        let engine = t.engine;
        let mut worker = engine.new_worker().unwrap();
        let (id, _) = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::array("dup", 8, 4))
            .unwrap();
        let err = engine
            .storage_manager()
            .create_storage(engine, &mut worker, StorageMetadata::array("dup", 8, 4))
            .unwrap_err();
        assert!(matches!(err, Error::StorageNameExists));
        assert_eq!(engine.storage_manager().storage_id_by_name("dup"), Some(id));

        let epoch = engine
            .storage_manager()
            .drop_storage(engine, &mut worker, id)
            .unwrap();
        assert!(epoch.is_valid());
        assert!(engine.storage_manager().get_storage(id).is_err());
        assert_eq!(engine.storage_manager().storage_id_by_name("dup"), None);
        // unknown id: warns, reports an invalid epoch, no error
        let epoch = engine
            .storage_manager()
            .drop_storage(engine, &mut worker, 999)
            .unwrap();
        assert!(!epoch.is_valid());
        drop(worker);
        t.teardown();
    }
}
