//! Log management: per-worker buffers, per-node loggers, and the durable
//! epoch frontier.
//!
//! Loggers wake on every epoch advance, copy the published byte ranges of
//! their assigned workers into a durable region, and push the durable epoch
//! forward. The durable region is the "durable log stream" the gleaner
//! mappers later read by byte offset. A worker inside its pre-commit window
//! advertises `in_commit_log_epoch`, which caps how far a logger may
//! advance, so the durable frontier never skips a committing transaction.
pub mod record;
pub mod thread_buffer;

use crate::engine::Engine;
use crate::epoch::{AtomicEpoch, Epoch, INITIAL_DURABLE_EPOCH};
use crate::error::{Error, Result};
use crate::thread;
use crate::worker::WorkerControl;
use byte_unit::Byte;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_LOGGERS_PER_NODE: usize = 1;
pub const DEFAULT_THREAD_BUFFER_SIZE: Byte = Byte::from_u64(1 << 20);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Loggers per NUMA node; also the gleaner mapper count per node.
    pub loggers_per_node: usize,
    /// Capacity of each worker's redo log buffer.
    pub thread_buffer_size: Byte,
}

impl LogConfig {
    #[inline]
    pub fn loggers_per_node(mut self, loggers_per_node: usize) -> Self {
        assert!(loggers_per_node > 0);
        self.loggers_per_node = loggers_per_node;
        self
    }

    #[inline]
    pub fn thread_buffer_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.thread_buffer_size = Byte::from(size);
        self
    }
}

impl Default for LogConfig {
    #[inline]
    fn default() -> Self {
        LogConfig {
            loggers_per_node: DEFAULT_LOGGERS_PER_NODE,
            thread_buffer_size: DEFAULT_THREAD_BUFFER_SIZE,
        }
    }
}

/// Append-only durable image of one logger's log stream.
pub struct DurableRegion {
    bytes: Vec<u8>,
    /// (flush bound epoch, region length after the flush); used by mappers
    /// to bound their scans.
    epoch_marks: Vec<(Epoch, usize)>,
}

impl DurableRegion {
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Prefix of the region known durable at or before `epoch`.
    pub fn bytes_through(&self, epoch: Epoch) -> &[u8] {
        let mut end = 0;
        for (mark, len) in &self.epoch_marks {
            if *mark == epoch || mark.before(epoch) {
                end = *len;
            } else {
                break;
            }
        }
        &self.bytes[..end]
    }
}

/// One logger: a durable region plus the workers assigned to it.
pub struct LoggerControl {
    id: usize,
    numa_node: u16,
    durable_epoch: AtomicEpoch,
    region: Mutex<DurableRegion>,
    workers: Mutex<Vec<Arc<WorkerControl>>>,
}

impl LoggerControl {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn numa_node(&self) -> u16 {
        self.numa_node
    }

    #[inline]
    pub fn durable_epoch(&self) -> Epoch {
        self.durable_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn region(&self) -> &Mutex<DurableRegion> {
        &self.region
    }
}

struct LoggerWakeup {
    stop: bool,
}

pub struct LogManager {
    initialized: AtomicBool,
    durable_global_epoch: CachePadded<AtomicEpoch>,
    loggers: Box<[Arc<LoggerControl>]>,
    loggers_per_node: usize,
    /// Round-robin assignment cursor per node.
    assign_cursor: Mutex<Vec<usize>>,
    wakeup: Mutex<LoggerWakeup>,
    wakeup_cv: Condvar,
    durable_mutex: Mutex<()>,
    durable_cv: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(config: &LogConfig, nodes: u16) -> LogManager {
        let mut loggers = Vec::new();
        for node in 0..nodes {
            for ordinal in 0..config.loggers_per_node {
                loggers.push(Arc::new(LoggerControl {
                    id: node as usize * config.loggers_per_node + ordinal,
                    numa_node: node,
                    durable_epoch: AtomicEpoch::new(INITIAL_DURABLE_EPOCH),
                    region: Mutex::new(DurableRegion {
                        bytes: Vec::new(),
                        epoch_marks: Vec::new(),
                    }),
                    workers: Mutex::new(Vec::new()),
                }));
            }
        }
        LogManager {
            initialized: AtomicBool::new(false),
            durable_global_epoch: CachePadded::new(AtomicEpoch::new(INITIAL_DURABLE_EPOCH)),
            loggers: loggers.into_boxed_slice(),
            loggers_per_node: config.loggers_per_node,
            assign_cursor: Mutex::new(vec![0; nodes as usize]),
            wakeup: Mutex::new(LoggerWakeup { stop: false }),
            wakeup_cv: Condvar::new(),
            durable_mutex: Mutex::new(()),
            durable_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn initialize(&'static self, engine: &'static Engine) -> Result<()> {
        tracing::info!(loggers = self.loggers.len(), "initializing LogManager");
        self.wakeup.lock().stop = false;
        let mut threads = self.threads.lock();
        for logger in self.loggers.iter() {
            let logger = Arc::clone(logger);
            let name = format!("logger-{}-{}", logger.numa_node, logger.id);
            threads.push(thread::spawn_named(name, move || {
                self.logger_loop(engine, &logger)
            }));
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn uninitialize(&self) -> Result<()> {
        tracing::info!("uninitializing LogManager");
        {
            let mut g = self.wakeup.lock();
            g.stop = true;
            self.wakeup_cv.notify_all();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
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
    pub fn loggers(&self) -> &[Arc<LoggerControl>] {
        &self.loggers
    }

    #[inline]
    pub fn loggers_per_node(&self) -> usize {
        self.loggers_per_node
    }

    /// Assigns a worker to one of its node's loggers, round-robin.
    pub fn register_worker(&self, control: &Arc<WorkerControl>) {
        let node = control.numa_node as usize;
        let mut cursors = self.assign_cursor.lock();
        let ordinal = cursors[node] % self.loggers_per_node;
        cursors[node] += 1;
        let logger = &self.loggers[node * self.loggers_per_node + ordinal];
        logger.workers.lock().push(Arc::clone(control));
    }

    #[inline]
    pub fn get_durable_global_epoch(&self) -> Epoch {
        self.durable_global_epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn get_durable_global_epoch_weak(&self) -> Epoch {
        self.durable_global_epoch.load(Ordering::Relaxed)
    }

    /// Kicks every logger, typically right after an epoch advance.
    #[inline]
    pub fn wakeup_loggers(&self) {
        self.wakeup_cv.notify_all();
    }

    /// Blocks until the durable epoch reaches `epoch`. A negative wait
    /// blocks indefinitely; zero polls once.
    pub fn wait_until_durable(&self, epoch: Epoch, wait_microseconds: i64) -> Result<()> {
        debug_assert!(epoch.is_valid());
        std::sync::atomic::fence(Ordering::Acquire);
        if self.reached(epoch) {
            return Ok(());
        }
        if wait_microseconds == 0 {
            return Err(Error::TimedOut);
        }
        let deadline = if wait_microseconds < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_micros(wait_microseconds as u64))
        };
        let mut g = self.durable_mutex.lock();
        loop {
            if self.reached(epoch) {
                return Ok(());
            }
            match deadline {
                None => self.durable_cv.wait(&mut g),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::TimedOut);
                    }
                    if self
                        .durable_cv
                        .wait_for(&mut g, deadline - now)
                        .timed_out()
                        && !self.reached(epoch)
                    {
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    #[inline]
    fn reached(&self, epoch: Epoch) -> bool {
        let durable = self.get_durable_global_epoch();
        durable == epoch || epoch.before(durable)
    }

    fn logger_loop(&self, engine: &'static Engine, logger: &LoggerControl) {
        loop {
            let stop = {
                let mut g = self.wakeup.lock();
                if !g.stop {
                    let interval = engine.config().xct.epoch_advance_interval_ms;
                    self.wakeup_cv
                        .wait_for(&mut g, Duration::from_millis(interval));
                }
                g.stop
            };
            self.flush_logger(engine, logger);
            if stop {
                return;
            }
        }
    }

    /// Copies all published ranges at or before the flush bound into the
    /// durable region and advances this logger's durable epoch.
    fn flush_logger(&self, engine: &'static Engine, logger: &LoggerControl) {
        let current = engine.xct_manager().get_current_global_epoch();
        let mut bound = current.one_less();
        // pairs with the committing worker's fence between its in-commit
        // guard store and its serialization-point epoch load.
        std::sync::atomic::fence(Ordering::SeqCst);
        let workers = logger.workers.lock();
        for wc in workers.iter() {
            let in_commit = wc.in_commit_log_epoch.load(Ordering::SeqCst);
            if in_commit.is_valid() {
                bound = bound.min(in_commit.one_less());
            }
        }
        {
            let mut region = logger.region.lock();
            for wc in workers.iter() {
                for range in wc.log_buffer.drain_published_through(bound) {
                    let bytes = wc.log_buffer.read_range(range.begin, range.end);
                    region.bytes.extend_from_slice(bytes);
                }
            }
            // marks stay monotone in epoch; the bound never regresses
            // because in-commit guards are at or above the last bound.
            let len = region.len();
            match region.epoch_marks.last_mut() {
                Some((mark, end)) if *mark == bound => *end = len,
                Some((mark, _)) if bound.before(*mark) => {}
                _ => region.epoch_marks.push((bound, len)),
            }
        }
        drop(workers);

        let durable_now = logger.durable_epoch.load(Ordering::Acquire);
        if durable_now.before(bound) {
            logger.durable_epoch.store(bound, Ordering::Release);
            self.update_durable_global_epoch();
        }
    }

    fn update_durable_global_epoch(&self) {
        let g = self.durable_mutex.lock();
        let mut min = Epoch::INVALID;
        for logger in self.loggers.iter() {
            let e = logger.durable_epoch();
            if !min.is_valid() {
                min = e;
            } else {
                min = min.min(e);
            }
        }
        let durable = self.get_durable_global_epoch();
        if durable.before(min) {
            tracing::debug!(%min, "advancing durable global epoch");
            self.durable_global_epoch.store(min, Ordering::SeqCst);
            self.durable_cv.notify_all();
        }
        drop(g);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.loggers_per_node, 1);
        assert_eq!(cfg.thread_buffer_size.as_u64(), 1 << 20);
        let cfg = cfg.loggers_per_node(2).thread_buffer_size(4096u64);
        assert_eq!(cfg.loggers_per_node, 2);
        assert_eq!(cfg.thread_buffer_size.as_u64(), 4096);
    }

    #[test]
    fn test_durable_region_bytes_through() {
        let region = DurableRegion {
            bytes: vec![0u8; 100],
            epoch_marks: vec![(Epoch::new(3), 40), (Epoch::new(4), 100)],
        };
        assert_eq!(region.bytes_through(Epoch::new(2)).len(), 0);
        assert_eq!(region.bytes_through(Epoch::new(3)).len(), 40);
        assert_eq!(region.bytes_through(Epoch::new(4)).len(), 100);
        assert_eq!(region.bytes_through(Epoch::new(9)).len(), 100);
    }
}
