//! User log record framing.

use crate::constants::{
    MAX_RECORD_PAYLOAD, RECORD_FOOTER_MAGIC, RECORD_FOOTER_SIZE, RECORD_HEADER_MAGIC,
    RECORD_HEADER_SIZE, RECORD_OVERHEAD,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use spire_common::{Result, SpireError};

use crate::anchor::LogAnchor;

/// A user log record: opaque payload bytes plus the LSN stamped by the
/// producer. The scanner fills one of these per call; the payload content is
/// never interpreted by the log core.
#[derive(Debug, Clone)]
pub struct UserLogRecord {
    /// LSN carried in the record frame.
    pub lsn: i64,
    /// Opaque payload.
    pub data: Bytes,
}

impl Default for UserLogRecord {
    fn default() -> Self {
        Self {
            lsn: LogAnchor::UNKNOWN_LSN,
            data: Bytes::new(),
        }
    }
}

/// Parsed per-record header.
///
/// Frame layout on disk (big-endian):
/// - header (20 bytes): magic, payload length, LSN, CRC32 of the payload
/// - payload: variable length
/// - footer (8 bytes): payload length echoed, closing magic
///
/// The echoed length lets the scanner reject a frame whose tail was torn off
/// even when the torn region happens to end on the next header boundary.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    /// Opening magic.
    pub magic: u32,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// LSN stamped by the producer.
    pub lsn: i64,
    /// CRC32 of the payload bytes.
    pub checksum: u32,
}

impl RecordHeader {
    /// Decodes a header from exactly [`RECORD_HEADER_SIZE`] bytes.
    pub fn from_bytes(mut data: &[u8]) -> Self {
        debug_assert_eq!(data.len(), RECORD_HEADER_SIZE);
        Self {
            magic: data.get_u32(),
            payload_len: data.get_u32(),
            lsn: data.get_i64(),
            checksum: data.get_u32(),
        }
    }
}

/// Total on-disk size of a frame holding `payload_len` payload bytes.
pub fn framed_len(payload_len: usize) -> usize {
    RECORD_OVERHEAD + payload_len
}

/// Frames a payload for appending: header, payload, footer.
pub fn frame_record(lsn: i64, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_RECORD_PAYLOAD {
        return Err(SpireError::RecordTooLarge {
            size: payload.len(),
            max: MAX_RECORD_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(framed_len(payload.len()));
    buf.put_u32(RECORD_HEADER_MAGIC);
    buf.put_u32(payload.len() as u32);
    buf.put_i64(lsn);
    buf.put_u32(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(RECORD_FOOTER_MAGIC);

    Ok(buf.freeze())
}

/// Verifies the footer of a frame against its header.
pub fn footer_matches(header: &RecordHeader, mut footer: &[u8]) -> bool {
    debug_assert_eq!(footer.len(), RECORD_FOOTER_SIZE);
    footer.get_u32() == header.payload_len && footer.get_u32() == RECORD_FOOTER_MAGIC
}
