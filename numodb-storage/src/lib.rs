pub mod engine;
pub mod epoch;
pub mod error;
pub mod lifetime;
pub mod log;
pub mod memory;
pub mod snapshot;
pub mod storage;
pub mod thread;
pub mod worker;
pub mod xct;

pub mod prelude {
    pub use crate::engine::*;
    pub use crate::epoch::*;
    pub use crate::error::*;
    pub use crate::storage::array::ArrayStorage;
    pub use crate::storage::{StorageId, StorageKind, StorageMetadata, StorageSpec};
    pub use crate::worker::Worker;
    pub use crate::xct::IsolationLevel;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::engine::{Engine, EngineConfig, ThreadConfig};
    use crate::lifetime::StaticLifetime;
    use crate::log::LogConfig;
    use crate::memory::MemoryConfig;
    use crate::snapshot::SnapshotConfig;
    use crate::xct::manager::XctConfig;

    /// A tiny engine with a fast epoch driver and a throwaway snapshot
    /// folder, dropped explicitly by `teardown`.
    pub(crate) struct TestEngine {
        pub engine: &'static Engine,
        _folder: tempfile::TempDir,
    }

    pub(crate) fn tiny_engine(nodes: u16) -> TestEngine {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let folder = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            memory: MemoryConfig::default()
                .use_numa_alloc(false)
                .pool_pages_per_node(512),
            xct: XctConfig::default().epoch_advance_interval_ms(5),
            log: LogConfig::default().thread_buffer_size(1u64 << 16),
            thread: ThreadConfig::default().group_count(nodes).workers_per_group(8),
            snapshot: SnapshotConfig::default()
                .folder_path(folder.path().to_string_lossy())
                .reducer_buffer_size(1u64 << 14),
        };
        TestEngine {
            engine: Engine::new(config).unwrap(),
            _folder: folder,
        }
    }

    impl TestEngine {
        pub(crate) fn teardown(self) {
            self.engine.uninitialize().unwrap();
            // SAFETY: all workers and background threads are gone.
            unsafe {
                StaticLifetime::drop_static(self.engine);
            }
        }
    }
}
