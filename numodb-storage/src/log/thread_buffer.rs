//! Per-worker redo log buffer.
//!
//! The buffer is single-writer, multi-reader: the owning worker appends
//! records beyond the committed watermark and either publishes them at
//! commit or discards them at abort; the assigned logger (and, transitively,
//! gleaner mappers) read only byte ranges at or below the committed
//! watermark.
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::log::record::{self, LogKind};
use crate::storage::StorageId;
use crate::xct::xct_id::XctId;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A committed byte range of one worker's buffer, tagged with the commit
/// epoch of the transaction that produced it.
#[derive(Debug, Clone, Copy)]
pub struct PublishedRange {
    pub epoch: Epoch,
    pub begin: usize,
    pub end: usize,
}

/// Shared side of a thread log buffer, reachable by the logger.
pub struct LogBufferShared {
    data: UnsafeCell<Box<[u8]>>,
    committed: AtomicUsize,
    published: Mutex<VecDeque<PublishedRange>>,
}

// Readers only touch bytes at or below `committed`; the writer only touches
// bytes above it. The watermark store is a release so a reader that observes
// a published range also observes its bytes.
unsafe impl Sync for LogBufferShared {}
unsafe impl Send for LogBufferShared {}

impl LogBufferShared {
    /// Bytes of a range published at or below the committed watermark.
    #[inline]
    pub fn read_range(&self, begin: usize, end: usize) -> &[u8] {
        debug_assert!(end <= self.committed.load(Ordering::Acquire));
        // SAFETY: the single-writer invariant above; these bytes are frozen.
        unsafe { &(&*self.data.get())[begin..end] }
    }

    /// Pops published ranges whose epoch is at or before `bound`, preserving
    /// publish order.
    pub fn drain_published_through(&self, bound: Epoch) -> Vec<PublishedRange> {
        let mut g = self.published.lock();
        let mut out = Vec::new();
        while let Some(front) = g.front() {
            if front.epoch == bound || front.epoch.before(bound) {
                out.push(*front);
                g.pop_front();
            } else {
                break;
            }
        }
        out
    }
}

/// Writer side, owned by the worker.
pub struct ThreadLogBuffer {
    shared: Arc<LogBufferShared>,
    tail: usize,
}

impl ThreadLogBuffer {
    pub fn new(capacity: usize) -> ThreadLogBuffer {
        ThreadLogBuffer {
            shared: Arc::new(LogBufferShared {
                data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
                committed: AtomicUsize::new(0),
                published: Mutex::new(VecDeque::new()),
            }),
            tail: 0,
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<LogBufferShared> {
        &self.shared
    }

    #[inline]
    pub fn offset_committed(&self) -> usize {
        self.shared.committed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn offset_tail(&self) -> usize {
        self.tail
    }

    /// Appends one encoded record; returns its offset. The xct_id field is
    /// stamped later, during commit apply.
    pub fn append_record(
        &mut self,
        kind: LogKind,
        storage_id: StorageId,
        payloads: &[&[u8]],
    ) -> Result<usize> {
        let payload_len: usize = payloads.iter().map(|p| p.len()).sum();
        let len = record::record_len(payload_len);
        let offset = self.tail;
        let slice = self.uncommitted_mut(offset, len)?;
        record::encode_into(slice, kind, storage_id, payloads);
        self.tail += len;
        Ok(offset)
    }

    /// The record bytes at `offset`, which must be in the uncommitted tail.
    #[inline]
    pub fn record_at(&self, offset: usize) -> &[u8] {
        debug_assert!(offset >= self.offset_committed() && offset < self.tail);
        // SAFETY: single-writer invariant; the range is uncommitted and thus
        // invisible to readers.
        let data = unsafe { &*self.shared.data.get() };
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        &data[offset..offset + len]
    }

    /// Stamps the final XctId into an uncommitted record.
    pub fn stamp_record_xct_id(&mut self, offset: usize, id: XctId) {
        debug_assert!(offset >= self.offset_committed() && offset < self.tail);
        // SAFETY: single-writer invariant as above.
        let data = unsafe { &mut *self.shared.data.get() };
        let len = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        record::stamp_xct_id(&mut data[offset..offset + len], id);
    }

    /// Makes the current transaction's tail visible to the logger, tagged
    /// with its commit epoch.
    pub fn publish_committed_log(&mut self, epoch: Epoch) {
        debug_assert!(epoch.is_valid());
        let begin = self.offset_committed();
        let end = self.tail;
        if begin == end {
            return;
        }
        let mut g = self.shared.published.lock();
        self.shared.committed.store(end, Ordering::Release);
        g.push_back(PublishedRange { epoch, begin, end });
    }

    /// Throws away the uncommitted tail of an aborted transaction.
    #[inline]
    pub fn discard_current_xct_log(&mut self) {
        self.tail = self.offset_committed();
    }

    fn uncommitted_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        // SAFETY: single-writer invariant; the range is above `committed`.
        let data = unsafe { &mut *self.shared.data.get() };
        if offset + len > data.len() {
            return Err(Error::LogBufferFull);
        }
        Ok(&mut data[offset..offset + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_drain() {
        let mut buf = ThreadLogBuffer::new(1 << 16);
        let payload = [1u8; 8];
        buf.append_record(LogKind::SequentialAppend, 3, &[&payload])
            .unwrap();
        assert_eq!(buf.offset_committed(), 0);
        buf.publish_committed_log(Epoch::new(4));
        assert_eq!(buf.offset_committed(), buf.offset_tail());

        let shared = Arc::clone(buf.shared());
        assert!(shared.drain_published_through(Epoch::new(3)).is_empty());
        let drained = shared.drain_published_through(Epoch::new(4));
        assert_eq!(drained.len(), 1);
        let bytes = shared.read_range(drained[0].begin, drained[0].end);
        let rec = record::LogRecord::parse(bytes).unwrap();
        assert_eq!(rec.kind(), LogKind::SequentialAppend);
        assert_eq!(rec.storage_id(), 3);
        // drained ranges are gone
        assert!(shared.drain_published_through(Epoch::new(9)).is_empty());
    }

    #[test]
    fn test_discard_resets_tail() {
        let mut buf = ThreadLogBuffer::new(1 << 12);
        buf.append_record(LogKind::Filler, 0, &[&[0u8; 8]]).unwrap();
        assert_ne!(buf.offset_tail(), 0);
        buf.discard_current_xct_log();
        assert_eq!(buf.offset_tail(), 0);
        assert_eq!(buf.offset_committed(), 0);
    }

    #[test]
    fn test_buffer_full() {
        let mut buf = ThreadLogBuffer::new(64);
        let big = [0u8; 128];
        let res = buf.append_record(LogKind::SequentialAppend, 1, &[&big]);
        assert!(matches!(res, Err(Error::LogBufferFull)));
    }
}
