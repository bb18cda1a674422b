//! Redo log record encoding.
//!
//! Every record is `[len: u32][storage_id: u32][xct_id: u64][kind: u8][pad:
//! 7]` followed by a kind-specific payload, little-endian, padded to 8-byte
//! alignment. The same bytes flow through the whole pipeline: appended to a
//! thread log buffer by the transaction, stamped with the final XctId during
//! commit apply, copied into a logger's durable region, and finally parsed
//! by gleaner mappers.
use crate::storage::StorageId;
use crate::xct::xct_id::XctId;

pub const HEADER_SIZE: usize = 24;
pub const LOG_ALIGN: usize = 8;
const XCT_ID_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    Filler = 0,
    CreateStorage = 1,
    DropStorage = 2,
    ArrayOverwrite = 3,
    SequentialAppend = 4,
}

impl LogKind {
    #[inline]
    pub fn from_u8(v: u8) -> Option<LogKind> {
        match v {
            0 => Some(LogKind::Filler),
            1 => Some(LogKind::CreateStorage),
            2 => Some(LogKind::DropStorage),
            3 => Some(LogKind::ArrayOverwrite),
            4 => Some(LogKind::SequentialAppend),
            _ => None,
        }
    }

    /// Storage-level (non-record) logs are routed to the gleaner's
    /// interleaved buffer instead of a reducer.
    #[inline]
    pub fn is_storage_log(self) -> bool {
        matches!(self, LogKind::CreateStorage | LogKind::DropStorage)
    }
}

#[inline]
pub const fn align_log(len: usize) -> usize {
    (len + LOG_ALIGN - 1) & !(LOG_ALIGN - 1)
}

#[inline]
pub const fn record_len(payload_len: usize) -> usize {
    align_log(HEADER_SIZE + payload_len)
}

/// Encodes one record into `slice`, which must be exactly
/// `record_len(sum of payload part lengths)` long. The xct_id field is left
/// zero; commit apply stamps it.
pub fn encode_into(slice: &mut [u8], kind: LogKind, storage_id: StorageId, payloads: &[&[u8]]) {
    let payload_len: usize = payloads.iter().map(|p| p.len()).sum();
    debug_assert_eq!(slice.len(), record_len(payload_len));
    let slice_len = slice.len() as u32;
    slice[0..4].copy_from_slice(&slice_len.to_le_bytes());
    slice[4..8].copy_from_slice(&storage_id.to_le_bytes());
    slice[8..16].copy_from_slice(&0u64.to_le_bytes());
    slice[16] = kind as u8;
    slice[17..HEADER_SIZE].fill(0);
    let mut at = HEADER_SIZE;
    for part in payloads {
        slice[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    slice[at..].fill(0);
}

/// Overwrites the xct_id field of an encoded record in place.
#[inline]
pub fn stamp_xct_id(slice: &mut [u8], id: XctId) {
    slice[XCT_ID_OFFSET..XCT_ID_OFFSET + 8].copy_from_slice(&id.word().to_le_bytes());
}

/// A parsed view over one encoded record.
#[derive(Clone, Copy)]
pub struct LogRecord<'a> {
    bytes: &'a [u8],
}

impl<'a> LogRecord<'a> {
    /// Parses the record at the head of `bytes`. Returns `None` on a
    /// truncated or unrecognized record.
    pub fn parse(bytes: &'a [u8]) -> Option<LogRecord<'a>> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if len < HEADER_SIZE || len % LOG_ALIGN != 0 || len > bytes.len() {
            return None;
        }
        LogKind::from_u8(bytes[16])?;
        Some(LogRecord {
            bytes: &bytes[..len],
        })
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn storage_id(&self) -> StorageId {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    #[inline]
    pub fn xct_id(&self) -> XctId {
        XctId::from_word(u64::from_le_bytes(self.bytes[8..16].try_into().unwrap()))
    }

    #[inline]
    pub fn kind(&self) -> LogKind {
        LogKind::from_u8(self.bytes[16]).unwrap()
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Array offset of an `ArrayOverwrite` record.
    #[inline]
    pub fn array_offset(&self) -> u64 {
        debug_assert_eq!(self.kind(), LogKind::ArrayOverwrite);
        u64::from_le_bytes(self.payload()[0..8].try_into().unwrap())
    }

    /// Payload data of an `ArrayOverwrite` record. `payload_size` trims the
    /// alignment padding.
    #[inline]
    pub fn array_data(&self, payload_size: usize) -> &'a [u8] {
        debug_assert_eq!(self.kind(), LogKind::ArrayOverwrite);
        &self.payload()[8..8 + payload_size]
    }
}

/// Iterates over the records packed in a byte region.
pub struct LogRecordIter<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> LogRecordIter<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8]) -> LogRecordIter<'a> {
        LogRecordIter { bytes, at: 0 }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.at
    }
}

impl<'a> Iterator for LogRecordIter<'a> {
    type Item = LogRecord<'a>;

    fn next(&mut self) -> Option<LogRecord<'a>> {
        let record = LogRecord::parse(&self.bytes[self.at..])?;
        self.at += record.len();
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;

    #[test]
    fn test_record_round_trip() {
        let data = [0xABu8; 16];
        let offset = 42u64.to_le_bytes();
        let len = record_len(8 + data.len());
        let mut buf = vec![0u8; len];
        encode_into(&mut buf, LogKind::ArrayOverwrite, 7, &[&offset, &data]);

        let record = LogRecord::parse(&buf).unwrap();
        assert_eq!(record.len(), len);
        assert_eq!(record.kind(), LogKind::ArrayOverwrite);
        assert_eq!(record.storage_id(), 7);
        assert_eq!(record.array_offset(), 42);
        assert_eq!(record.array_data(16), &data);
        assert!(!record.xct_id().is_valid());

        let id = XctId::new(Epoch::new(5), 3);
        stamp_xct_id(&mut buf, id);
        let record = LogRecord::parse(&buf).unwrap();
        assert_eq!(record.xct_id(), id);
    }

    #[test]
    fn test_record_iter() {
        let mut buf = vec![];
        for i in 0..3u64 {
            let payload = i.to_le_bytes();
            let mut rec = vec![0u8; record_len(payload.len())];
            encode_into(&mut rec, LogKind::SequentialAppend, 1, &[&payload]);
            buf.extend_from_slice(&rec);
        }
        let offsets: Vec<u64> = LogRecordIter::new(&buf)
            .map(|r| u64::from_le_bytes(r.payload()[0..8].try_into().unwrap()))
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogRecord::parse(&[0u8; 4]).is_none());
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&64u32.to_le_bytes()); // longer than the slice
        assert!(LogRecord::parse(&buf).is_none());
    }
}
