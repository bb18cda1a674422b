//! The engine façade: configuration, module wiring, and lifecycle.
//!
//! All global mutable state (the current epoch, the storage registry, page
//! pools, the MCS block arena) hangs off one `Engine` value that is leaked
//! to `'static` and passed by handle; subsystems hold no back-references of
//! their own. Modules initialize in dependency order (storage, log,
//! transaction, snapshot) and uninitialize in reverse.
use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use crate::log::{LogConfig, LogManager};
use crate::memory::MemoryConfig;
use crate::snapshot::{SnapshotConfig, SnapshotManager};
use crate::storage::page::PagePoolSet;
use crate::storage::StorageManager;
use crate::worker::{Worker, WorkerControl};
use crate::xct::manager::{XctConfig, XctManager};
use crate::xct::mcs::McsArena;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

pub const DEFAULT_GROUP_COUNT: u16 = 1;
pub const DEFAULT_WORKERS_PER_GROUP: u16 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Number of NUMA nodes the engine runs on.
    pub group_count: u16,
    /// Workers per node.
    pub workers_per_group: u16,
}

impl ThreadConfig {
    #[inline]
    pub fn group_count(mut self, group_count: u16) -> Self {
        assert!(group_count > 0);
        self.group_count = group_count;
        self
    }

    #[inline]
    pub fn workers_per_group(mut self, workers_per_group: u16) -> Self {
        assert!(workers_per_group > 0);
        self.workers_per_group = workers_per_group;
        self
    }
}

impl Default for ThreadConfig {
    #[inline]
    fn default() -> Self {
        ThreadConfig {
            group_count: DEFAULT_GROUP_COUNT,
            workers_per_group: DEFAULT_WORKERS_PER_GROUP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub memory: MemoryConfig,
    pub xct: XctConfig,
    pub log: LogConfig,
    pub thread: ThreadConfig,
    pub snapshot: SnapshotConfig,
}

pub struct Engine {
    config: EngineConfig,
    page_pools: PagePoolSet,
    mcs_arena: McsArena,
    storage_manager: StorageManager,
    log_manager: LogManager,
    xct_manager: XctManager,
    snapshot_manager: SnapshotManager,
    workers: Mutex<Vec<Arc<WorkerControl>>>,
    next_worker: AtomicU16,
    initialized: AtomicBool,
}

impl Engine {
    /// Builds and initializes an engine. The returned reference is leaked;
    /// call [`Engine::uninitialize`] and then
    /// [`StaticLifetime::drop_static`] to tear it down.
    pub fn new(config: EngineConfig) -> Result<&'static Engine> {
        let nodes = config.thread.group_count;
        let max_workers = nodes as usize * config.thread.workers_per_group as usize;
        let page_pools = PagePoolSet::new(nodes, &config.memory)?;
        let mcs_arena = McsArena::new(max_workers, config.xct.mcs_blocks_per_worker);
        let log_manager = LogManager::new(&config.log, nodes);
        let snapshot_manager = SnapshotManager::new(&config.snapshot, nodes)?;
        let engine = StaticLifetime::new_static(Engine {
            config,
            page_pools,
            mcs_arena,
            storage_manager: StorageManager::new(),
            log_manager,
            xct_manager: XctManager::new(),
            snapshot_manager,
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicU16::new(0),
            initialized: AtomicBool::new(false),
        });
        engine.initialize()?;
        Ok(engine)
    }

    fn initialize(&'static self) -> Result<()> {
        tracing::info!("initializing engine");
        self.storage_manager.initialize()?;
        self.log_manager.initialize(self)?;
        self.xct_manager.initialize(self)?;
        self.snapshot_manager.initialize(self)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops background threads and uninitializes modules in reverse
    /// dependency order. Later errors do not stop earlier teardowns; the
    /// first error is reported.
    pub fn uninitialize(&self) -> Result<()> {
        tracing::info!("uninitializing engine");
        let mut first_error: Option<Error> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };
        note(self.snapshot_manager.uninitialize());
        note(self.xct_manager.uninitialize(self));
        note(self.log_manager.uninitialize());
        note(self.storage_manager.uninitialize());
        self.initialized.store(false, Ordering::Release);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn page_pools(&self) -> &PagePoolSet {
        &self.page_pools
    }

    #[inline]
    pub fn mcs_arena(&self) -> &McsArena {
        &self.mcs_arena
    }

    #[inline]
    pub fn storage_manager(&self) -> &StorageManager {
        &self.storage_manager
    }

    #[inline]
    pub fn log_manager(&self) -> &LogManager {
        &self.log_manager
    }

    #[inline]
    pub fn xct_manager(&self) -> &XctManager {
        &self.xct_manager
    }

    #[inline]
    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    /// Creates a worker pinned (logically) to a NUMA node, round-robin
    /// across nodes, and registers it with its node's logger.
    pub fn new_worker(&'static self) -> Result<Worker> {
        if !self.is_initialized() {
            return Err(Error::DependentModuleUnavailableInit);
        }
        let max_workers =
            self.config.thread.group_count as u32 * self.config.thread.workers_per_group as u32;
        let id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        if id as u32 >= max_workers {
            return Err(Error::TooManyWorkers);
        }
        let numa_node = id % self.config.thread.group_count;
        let worker = Worker::new(self, id, numa_node);
        self.workers.lock().push(Arc::clone(&worker.control));
        self.log_manager.register_worker(&worker.control);
        Ok(worker)
    }
}

unsafe impl StaticLifetime for Engine {}

impl Drop for Engine {
    fn drop(&mut self) {
        debug_assert!(
            !self.is_initialized(),
            "engine dropped while initialized; call uninitialize() first"
        );
    }
}
