//! Record types and the on-disk codec.
//!
//! Every segment begins with a 3-byte header record and then carries a
//! sequence of framed data records:
//!
//! ```text
//! header record:  +--------+-----------+
//!                 | tag=1  | version   |
//!                 | 1 byte | 2 bytes   |
//!                 +--------+-----------+
//! data record:    +--------+-----------+----------+---------------+
//!                 | tag    | length    | crc32c   | payload       |
//!                 | 1 byte | 4 bytes   | 4 bytes  | length bytes  |
//!                 +--------+-----------+----------+---------------+
//! ```
//!
//! All integers are big-endian. Tag `0x00` is the switch-segment marker: a
//! single byte whose presence means "stop reading this segment". Zero-filled
//! padding in a pre-allocated segment decodes the same way.
//!
//! The CRC covers the record's log position (segment index and file offset)
//! followed by the tag and the payload. Work segments live in a recycled
//! ring, and after a crash a slot can still hold an intact record from an
//! earlier lap; a position-bound checksum fails verification at the record's
//! new address.

use crate::error::WalError;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// Reserved tag ending a segment before its physical end.
pub const SWITCH_SEGMENT_TAG: u8 = 0x00;

/// Tag of the per-segment header record.
pub const HEADER_TAG: u8 = 0x01;

/// Encoded size of the segment header record.
pub const SEGMENT_HEADER_SIZE: u32 = 3;

/// Framing overhead of a data record (tag + length + crc).
pub const DATA_FRAME_OVERHEAD: u32 = 9;

/// Current serializer version, embedded in every segment header.
pub const SERIALIZER_VERSION: u16 = 1;

/// Maximum record payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Type of a data record. Tags 0 and 1 are reserved for the switch-segment
/// marker and the segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Host data mutation.
    Data = 2,
    /// Checkpoint marker written by the host's recovery machinery.
    Checkpoint = 3,
}

impl RecordType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            2 => Some(RecordType::Data),
            3 => Some(RecordType::Checkpoint),
            _ => None,
        }
    }
}

/// One log record: a type and an opaque payload owned by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub record_type: RecordType,
    pub payload: Bytes,
}

impl WalRecord {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            record_type: RecordType::Data,
            payload: payload.into(),
        }
    }

    pub fn checkpoint(payload: impl Into<Bytes>) -> Self {
        Self {
            record_type: RecordType::Checkpoint,
            payload: payload.into(),
        }
    }
}

/// Outcome of decoding at a segment position.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete record.
    Record(WalRecord),
    /// A switch-segment marker or zero padding; no further records here.
    EndOfSegment,
}

/// Serializer for log records.
///
/// `size` is deterministic and performs no I/O; `encode_into` produces
/// exactly `size` bytes. Decoding consumes exactly the encoded size and
/// distinguishes truncation (the reader ends mid-record) from corruption
/// (a CRC or framing check fails).
#[derive(Debug, Clone)]
pub struct RecordCodec {
    version: u16,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCodec {
    pub fn new() -> Self {
        Self {
            version: SERIALIZER_VERSION,
        }
    }

    /// Serializer version embedded in segment headers.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Encoded size of the given record.
    pub fn size(&self, record: &WalRecord) -> u32 {
        DATA_FRAME_OVERHEAD + record.payload.len() as u32
    }

    /// Encoded size of the segment header record.
    pub fn header_size(&self) -> u32 {
        SEGMENT_HEADER_SIZE
    }

    /// Encodes the segment header record.
    pub fn encode_header_into(&self, buf: &mut BytesMut) {
        buf.put_u8(HEADER_TAG);
        buf.put_u16(self.version);
    }

    /// Encodes `record` for position `(segment, offset)`.
    pub fn encode_into(&self, record: &WalRecord, segment: u64, offset: u32, buf: &mut BytesMut) {
        let tag = record.record_type as u8;
        buf.put_u8(tag);
        buf.put_u32(record.payload.len() as u32);
        buf.put_u32(record_crc(segment, offset, tag, &record.payload));
        buf.put_slice(&record.payload);
    }

    /// Decodes the record at `(segment, offset)` from `reader`.
    pub fn decode_from<R: Read>(
        &self,
        reader: &mut R,
        segment: u64,
        offset: u32,
    ) -> Result<ReadOutcome, WalError> {
        let mut tag = [0u8; 1];
        read_frame(reader, &mut tag, segment, offset)?;
        if tag[0] == SWITCH_SEGMENT_TAG {
            return Ok(ReadOutcome::EndOfSegment);
        }
        let record_type = RecordType::from_tag(tag[0]).ok_or(WalError::UnknownType {
            segment,
            offset,
            tag: tag[0],
        })?;

        let mut len_buf = [0u8; 4];
        read_frame(reader, &mut len_buf, segment, offset)?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WalError::CorruptRecord {
                segment,
                offset,
                reason: format!("implausible payload length {payload_len}"),
            });
        }

        let mut crc_buf = [0u8; 4];
        read_frame(reader, &mut crc_buf, segment, offset)?;
        let expected = u32::from_be_bytes(crc_buf);

        let mut payload = vec![0u8; payload_len];
        read_frame(reader, &mut payload, segment, offset)?;

        let actual = record_crc(segment, offset, tag[0], &payload);
        if actual != expected {
            return Err(WalError::CorruptRecord {
                segment,
                offset,
                reason: format!("CRC mismatch (expected {expected:#010x}, got {actual:#010x})"),
            });
        }

        Ok(ReadOutcome::Record(WalRecord {
            record_type,
            payload: Bytes::from(payload),
        }))
    }

    /// Decodes the segment header at the start of `reader`.
    ///
    /// Returns `None` when the segment starts with a zero byte or is empty:
    /// a formatted slot that was never written.
    pub fn decode_header_from<R: Read>(
        &self,
        reader: &mut R,
        segment: u64,
    ) -> Result<Option<u16>, WalError> {
        let mut tag = [0u8; 1];
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if tag[0] == SWITCH_SEGMENT_TAG {
            return Ok(None);
        }
        if tag[0] != HEADER_TAG {
            return Err(WalError::CorruptLog(format!(
                "segment {segment} does not start with a header record (tag {})",
                tag[0]
            )));
        }
        let mut version = [0u8; 2];
        match reader.read_exact(&mut version) {
            Ok(()) => Ok(Some(u16::from_be_bytes(version))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WalError::TruncatedRecord {
                segment,
                offset: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_frame<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    segment: u64,
    offset: u32,
) -> Result<(), WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(WalError::TruncatedRecord { segment, offset })
        }
        Err(e) => Err(e.into()),
    }
}

fn record_crc(segment: u64, offset: u32, tag: u8, payload: &[u8]) -> u32 {
    let mut position = [0u8; 13];
    position[..8].copy_from_slice(&segment.to_be_bytes());
    position[8..12].copy_from_slice(&offset.to_be_bytes());
    position[12] = tag;
    crc32c::crc32c_append(crc32c::crc32c(&position), payload)
}
