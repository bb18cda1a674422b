//! Per-storage partitioning policy for the log gleaner.
//!
//! A partitioner turns a record key into the id of the reducer (one per
//! NUMA node) that should materialize the record's snapshot page. The set of
//! storage kinds is closed, so dispatch is an enum rather than a trait
//! object.
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::storage::page::INTERIOR_FANOUT;
use crate::storage::{StorageControlBlock, StorageId, StorageKind, StorageSpec};
use crate::storage::array;

pub type PartitionId = u16;

/// Precomputed constant divisor: one 128-bit multiply and at most one fixup
/// instead of a hardware division per log record.
#[derive(Debug, Clone, Copy)]
pub struct ConstDiv {
    divisor: u64,
    magic: u128,
}

impl ConstDiv {
    #[inline]
    pub fn new(divisor: u64) -> ConstDiv {
        debug_assert!(divisor > 0);
        // ceil(2^64 / divisor); the quotient below overshoots by at most 1.
        let magic = ((1u128 << 64) + divisor as u128 - 1) / divisor as u128;
        ConstDiv { divisor, magic }
    }

    #[inline]
    pub fn divisor(&self) -> u64 {
        self.divisor
    }

    #[inline]
    pub fn div(&self, n: u64) -> u64 {
        let q = ((n as u128 * self.magic) >> 64) as u64;
        let q = if q.checked_mul(self.divisor).map_or(true, |p| p > n) {
            q - 1
        } else {
            q
        };
        debug_assert_eq!(q, n / self.divisor);
        q
    }
}

/// Partitioning policy of one array storage.
///
/// The offset range is split into `INTERIOR_FANOUT`-sized buckets; each
/// bucket is owned by the NUMA node currently holding the volatile page
/// under the root, then ownership is balanced so that no partition owns more
/// than `ceil(buckets / partitions)` buckets.
pub struct ArrayPartitioner {
    storage_id: StorageId,
    /// Single-page arrays have no interior page and nothing to partition.
    single_page: bool,
    home_partition: PartitionId,
    array_size: u64,
    bucket_size_div: ConstDiv,
    buckets: usize,
    bucket_owners: [PartitionId; INTERIOR_FANOUT],
}

impl ArrayPartitioner {
    fn new(engine: &Engine, cb: &StorageControlBlock) -> Result<ArrayPartitioner> {
        let (payload_size, array_size) = match cb.meta.spec {
            StorageSpec::Array {
                payload_size,
                array_size,
            } => (payload_size, array_size),
            _ => return Err(Error::InvalidStorageId),
        };
        let partitions = engine.page_pools().nodes() as usize;
        let root_ptr = cb.root_page_pointer.volatile_ptr();
        if root_ptr.is_null() {
            return Err(Error::InvalidStorageId);
        }
        // SAFETY: volatile pages stay mapped for the engine lifetime.
        let root = unsafe { &*engine.page_pools().resolve(root_ptr) };

        let capacity = array::leaf_capacity(payload_size) as u64;
        let leaves = array_size.div_ceil(capacity);
        let bucket_size = array_size.div_ceil(INTERIOR_FANOUT as u64).max(1);
        let buckets = array_size.div_ceil(bucket_size) as usize;

        let mut owners = [0 as PartitionId; INTERIOR_FANOUT];
        let mut home_partition = 0;
        if leaves <= 1 {
            let child = root.interior_child(0).volatile_ptr();
            if !child.is_null() {
                home_partition = child.numa_node();
            }
            return Ok(ArrayPartitioner {
                storage_id: cb.meta.id,
                single_page: true,
                home_partition,
                array_size,
                bucket_size_div: ConstDiv::new(bucket_size),
                buckets,
                bucket_owners: owners,
            });
        }

        for (bucket, owner) in owners.iter_mut().enumerate().take(buckets) {
            let offset = bucket as u64 * bucket_size;
            let child = root.interior_child((offset / capacity) as usize).volatile_ptr();
            *owner = if child.is_null() {
                0
            } else {
                child.numa_node() as PartitionId
            };
        }
        balance_bucket_owners(&mut owners[..buckets], partitions);
        let assigned: std::collections::HashSet<PartitionId> =
            owners[..buckets].iter().copied().collect();
        if assigned.len() < partitions {
            tracing::warn!(
                storage_id = cb.meta.id,
                partitions,
                assigned = assigned.len(),
                "array has fewer direct children than partitions; some partitions \
                 receive no bucket"
            );
        }
        Ok(ArrayPartitioner {
            storage_id: cb.meta.id,
            single_page: false,
            home_partition,
            array_size,
            bucket_size_div: ConstDiv::new(bucket_size),
            buckets,
            bucket_owners: owners,
        })
    }

    #[inline]
    pub fn is_partitionable(&self) -> bool {
        !self.single_page
    }

    /// Destination partition of one overwrite log.
    #[inline]
    pub fn partition(&self, offset: u64) -> PartitionId {
        if self.single_page {
            return self.home_partition;
        }
        debug_assert!(offset < self.array_size);
        let bucket = self.bucket_size_div.div(offset) as usize;
        debug_assert!(bucket < self.buckets);
        self.bucket_owners[bucket]
    }

    /// Batched variant used by mappers on hot paths.
    #[inline]
    pub fn partition_batch(&self, offsets: &[u64], results: &mut [PartitionId]) {
        debug_assert_eq!(offsets.len(), results.len());
        for (offset, result) in offsets.iter().zip(results.iter_mut()) {
            *result = self.partition(*offset);
        }
    }
}

/// Rebalances bucket ownership in place: a partition over the
/// `ceil(buckets/partitions)` cap donates its excess buckets to the first
/// under-capacity partitions in partition-id order.
fn balance_bucket_owners(owners: &mut [PartitionId], partitions: usize) {
    if owners.is_empty() || partitions <= 1 {
        return;
    }
    let cap = owners.len().div_ceil(partitions);
    let mut counts = vec![0usize; partitions];
    for owner in owners.iter() {
        counts[*owner as usize] += 1;
    }
    for i in 0..owners.len() {
        let owner = owners[i] as usize;
        if counts[owner] > cap {
            if let Some(needy) = (0..partitions).find(|p| counts[*p] < cap) {
                counts[owner] -= 1;
                counts[needy] += 1;
                owners[i] = needy as PartitionId;
            }
        }
    }
}

/// Closed per-kind dispatch, created lazily by the gleaner's registry.
pub enum Partitioner {
    Array(ArrayPartitioner),
    /// Sequential logs stay on the mapper's own partition.
    Sequential { storage_id: StorageId },
    /// Hash and masstree page layouts are external; their records all go to
    /// the storage's home partition until those layouts are linked in.
    SinglePartition {
        storage_id: StorageId,
        home_partition: PartitionId,
    },
}

impl Partitioner {
    pub fn create(engine: &Engine, storage_id: StorageId) -> Result<Partitioner> {
        let cb = engine.storage_manager().get_storage(storage_id)?;
        match cb.meta.kind {
            StorageKind::Array => Ok(Partitioner::Array(ArrayPartitioner::new(engine, &cb)?)),
            StorageKind::Sequential => Ok(Partitioner::Sequential { storage_id }),
            StorageKind::Hash | StorageKind::Masstree => Ok(Partitioner::SinglePartition {
                storage_id,
                home_partition: 0,
            }),
        }
    }

    #[inline]
    pub fn storage_id(&self) -> StorageId {
        match self {
            Partitioner::Array(a) => a.storage_id,
            Partitioner::Sequential { storage_id } => *storage_id,
            Partitioner::SinglePartition { storage_id, .. } => *storage_id,
        }
    }

    /// Destination partition for a record with the given key, mapped by a
    /// mapper running on `local_partition`.
    #[inline]
    pub fn partition(&self, local_partition: PartitionId, key: u64) -> PartitionId {
        match self {
            Partitioner::Array(a) => a.partition(key),
            Partitioner::Sequential { .. } => local_partition,
            Partitioner::SinglePartition { home_partition, .. } => *home_partition,
        }
    }
}
