//! Gleaner mapper: reads one logger's durable log stream and partitions its
//! records across the reducers.
use crate::error::{Error, Result};
use crate::log::record::LogRecordIter;
use crate::log::LoggerControl;
use crate::snapshot::gleaner::{LogGleaner, SortEntry};
use crate::storage::partition::PartitionId;
use std::sync::Arc;

/// Records per batch pushed to a reducer queue.
const MAPPER_BATCH: usize = 256;

pub(crate) fn run(
    gleaner: Arc<LogGleaner>,
    logger: Arc<LoggerControl>,
    senders: Vec<flume::Sender<Vec<SortEntry>>>,
) {
    scopeguard::defer! {
        gleaner.on_component_exit();
    }
    if !gleaner.ready_and_wait_for_start() {
        return;
    }
    match map_logger(&gleaner, &logger, &senders) {
        Ok(()) => gleaner.mapper_completed(),
        Err(e) => gleaner.report_error(format!("mapper {}: {e}", logger.id())),
    }
}

fn map_logger(
    gleaner: &LogGleaner,
    logger: &LoggerControl,
    senders: &[flume::Sender<Vec<SortEntry>>],
) -> Result<()> {
    // freeze this logger's durable stream at the gleaned epoch.
    let bytes: Vec<u8> = {
        let region = logger.region().lock();
        region.bytes_through(gleaner.valid_until_epoch()).to_vec()
    };
    let local_partition = logger.numa_node() as PartitionId;
    let base = gleaner.base_epoch();
    let valid_until = gleaner.valid_until_epoch();

    let mut batches: Vec<Vec<SortEntry>> = (0..senders.len()).map(|_| Vec::new()).collect();
    let mut mapped = 0usize;
    for record in LogRecordIter::new(&bytes) {
        if gleaner.is_stop_requested() {
            return Ok(());
        }
        let kind = record.kind();
        if kind == crate::log::record::LogKind::Filler {
            continue;
        }
        if kind.is_storage_log() {
            gleaner.add_nonrecord_log(record.bytes());
            continue;
        }
        let epoch = record.xct_id().epoch();
        if !epoch.is_valid() {
            continue;
        }
        // glean only (base, valid_until]
        if base.is_valid() && !base.before(epoch) {
            continue;
        }
        if valid_until.before(epoch) {
            continue;
        }
        let partitioner = match gleaner.get_or_create_partitioner(record.storage_id()) {
            Ok(p) => p,
            // the storage was dropped after this record was logged.
            Err(Error::InvalidStorageId) => continue,
            Err(e) => return Err(e),
        };
        let key = match kind {
            crate::log::record::LogKind::ArrayOverwrite => record.array_offset(),
            _ => 0,
        };
        let partition = partitioner.partition(local_partition, key) as usize;
        let partition = partition.min(senders.len() - 1);
        batches[partition].push(SortEntry {
            storage_id: record.storage_id(),
            kind,
            key,
            xct_id: record.xct_id(),
            payload: record.payload().to_vec(),
        });
        mapped += 1;
        if batches[partition].len() >= MAPPER_BATCH {
            let batch = std::mem::take(&mut batches[partition]);
            if senders[partition].send(batch).is_err() {
                // receiver gone: the run is being cancelled.
                return Ok(());
            }
        }
    }
    for (partition, batch) in batches.into_iter().enumerate() {
        if !batch.is_empty() && senders[partition].send(batch).is_err() {
            return Ok(());
        }
    }
    tracing::debug!(logger = logger.id(), mapped, "mapper done");
    Ok(())
}
