//! MCS queue lock used as the per-record key lock during commit.
//!
//! Each lockable record embeds a 32-bit tail word. Queue nodes ("blocks")
//! are preallocated per worker in an engine-owned arena so that any thread
//! can reach any other thread's block. The tail word encodes
//! `{worker_id + 1 : 16 | block : 16}`; 0 means unlocked, and block index 0
//! is reserved for "no lock held". Acquisition is FIFO and starvation-free;
//! acquisition and release never fail.
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Tail word of one record's key lock.
#[repr(transparent)]
pub struct McsLock(AtomicU32);

impl McsLock {
    #[inline]
    pub const fn new() -> McsLock {
        McsLock(AtomicU32::new(0))
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

impl Default for McsLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

struct McsBlock {
    waiting: AtomicBool,
    successor: AtomicU32,
}

/// Engine-owned arena of MCS blocks, indexed by (worker, block).
pub struct McsArena {
    blocks_per_worker: usize,
    blocks: Box<[CachePadded<McsBlock>]>,
}

impl McsArena {
    pub fn new(max_workers: usize, blocks_per_worker: usize) -> McsArena {
        debug_assert!(blocks_per_worker >= 2);
        debug_assert!(blocks_per_worker <= u16::MAX as usize + 1);
        let total = max_workers * blocks_per_worker;
        let blocks = (0..total)
            .map(|_| {
                CachePadded::new(McsBlock {
                    waiting: AtomicBool::new(false),
                    successor: AtomicU32::new(0),
                })
            })
            .collect();
        McsArena {
            blocks_per_worker,
            blocks,
        }
    }

    #[inline]
    pub fn blocks_per_worker(&self) -> usize {
        self.blocks_per_worker
    }

    #[inline]
    fn encode(worker: u16, block: u16) -> u32 {
        debug_assert!(block != 0);
        ((worker as u32 + 1) << 16) | block as u32
    }

    #[inline]
    fn block(&self, word: u32) -> &McsBlock {
        debug_assert!(word != 0);
        let worker = (word >> 16) as usize - 1;
        let block = (word & 0xFFFF) as usize;
        &self.blocks[worker * self.blocks_per_worker + block]
    }

    /// Enqueue and spin until this worker owns the lock.
    pub fn acquire(&self, lock: &McsLock, worker: u16, block: u16) {
        let me = Self::encode(worker, block);
        let node = self.block(me);
        node.waiting.store(true, Ordering::Relaxed);
        node.successor.store(0, Ordering::Relaxed);
        let pred = lock.0.swap(me, Ordering::AcqRel);
        if pred == 0 {
            return;
        }
        self.block(pred).successor.store(me, Ordering::Release);
        while node.waiting.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// Release the lock held with the given block. Infallible.
    pub fn release(&self, lock: &McsLock, worker: u16, block: u16) {
        let me = Self::encode(worker, block);
        let node = self.block(me);
        if lock
            .0
            .compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // a successor is enqueueing; wait for it to link itself.
        let mut succ = node.successor.load(Ordering::Acquire);
        while succ == 0 {
            std::hint::spin_loop();
            succ = node.successor.load(Ordering::Acquire);
        }
        self.block(succ).waiting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_mcs_single_thread() {
        let arena = McsArena::new(1, 16);
        let lock = McsLock::new();
        assert!(!lock.is_locked());
        arena.acquire(&lock, 0, 1);
        assert!(lock.is_locked());
        arena.release(&lock, 0, 1);
        assert!(!lock.is_locked());
        // blocks are reusable across transactions
        arena.acquire(&lock, 0, 1);
        arena.release(&lock, 0, 1);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mcs_mutual_exclusion() {
        const WORKERS: usize = 8;
        const ROUNDS: usize = 2000;
        struct Shared {
            arena: McsArena,
            lock: McsLock,
            counter: AtomicUsize,
        }
        // counter increments are done non-atomically in a load/store pair
        // guarded by the lock; any mutual-exclusion violation loses counts.
        let shared = Arc::new(Shared {
            arena: McsArena::new(WORKERS, 16),
            lock: McsLock::new(),
            counter: AtomicUsize::new(0),
        });
        let mut handles = vec![];
        for w in 0..WORKERS {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    shared.arena.acquire(&shared.lock, w as u16, 1);
                    let v = shared.counter.load(Ordering::Relaxed);
                    std::hint::spin_loop();
                    shared.counter.store(v + 1, Ordering::Relaxed);
                    shared.arena.release(&shared.lock, w as u16, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.counter.load(Ordering::SeqCst), WORKERS * ROUNDS);
        assert!(!shared.lock.is_locked());
    }
}
