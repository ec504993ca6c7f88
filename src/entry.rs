//! Log entry model and on-disk record framing.
//!
//! An [`Entry`] is opaque to the storage engine except for its `index` and
//! `term`. On disk each entry is wrapped in a CRC-protected frame:
//!
//! ```text
//! | type(1) | payload_len(4, LE) | payload(payload_len) | crc32(4, LE) |
//! ```
//!
//! The checksum covers `type || payload_len || payload`.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Frame prefix: type tag plus payload length.
pub const RECORD_HEADER_SIZE: u64 = 5;
/// Frame overhead around the payload: header plus trailing crc32.
pub const RECORD_OVERHEAD: u64 = RECORD_HEADER_SIZE + 4;

/// Record type tag for a normal log entry. Other values are reserved.
const RECORD_TYPE_ENTRY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum EntryType {
    Normal,
    ConfChange,
}

/// One Raft log entry. Indices are strictly positive and assigned
/// monotonically by the consensus layer; `data` is an opaque command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Normal,
            data,
        }
    }

    pub fn payload(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Serialized payload length in bytes, the unit of the `max_size` cap
    /// on range reads.
    pub fn byte_size(&self) -> u64 {
        self.payload().map(|p| p.len() as u64).unwrap_or(0)
    }
}

/// Encode one entry into its framed on-disk representation.
pub(crate) fn encode_record(entry: &Entry) -> StorageResult<Vec<u8>> {
    let payload = entry.payload()?;
    let mut buf = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
    buf.push(RECORD_TYPE_ENTRY);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Outcome of decoding a single frame out of `buf`.
#[derive(Debug)]
pub(crate) struct DecodedRecord {
    pub entry: Entry,
    /// Serialized payload length (excluding frame overhead).
    pub payload_len: u64,
    /// Total frame length consumed from the buffer.
    pub frame_len: u64,
}

/// Decode the record frame at the start of `buf`.
///
/// Returns a plain-string reason on any mismatch so callers can attach the
/// file path and offset they are scanning.
pub(crate) fn decode_record(buf: &[u8]) -> Result<DecodedRecord, String> {
    if (buf.len() as u64) < RECORD_OVERHEAD {
        return Err(format!("short record frame: {} bytes", buf.len()));
    }
    let typ = buf[0];
    if typ != RECORD_TYPE_ENTRY {
        return Err(format!("unknown record type {}", typ));
    }
    let payload_len = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as u64;
    let frame_len = RECORD_OVERHEAD + payload_len;
    if (buf.len() as u64) < frame_len {
        return Err(format!(
            "record frame truncated: need {} bytes, have {}",
            frame_len,
            buf.len()
        ));
    }
    let crc_offset = (RECORD_HEADER_SIZE + payload_len) as usize;
    let expected = u32::from_le_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
    let actual = crc32fast::hash(&buf[..crc_offset]);
    if expected != actual {
        return Err(format!(
            "record crc mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        ));
    }
    let payload = &buf[RECORD_HEADER_SIZE as usize..crc_offset];
    let (entry, consumed): (Entry, usize) =
        bincode::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| format!("entry payload decode failed: {}", e))?;
    if consumed != payload.len() {
        return Err(format!(
            "entry payload has {} trailing bytes",
            payload.len() - consumed
        ));
    }
    Ok(DecodedRecord {
        entry,
        payload_len,
        frame_len,
    })
}

/// Decode a record read back by index and classify failures as corruption
/// of the given file location.
pub(crate) fn decode_record_at(
    buf: &[u8],
    path: &std::path::Path,
    offset: u64,
) -> StorageResult<DecodedRecord> {
    decode_record(buf).map_err(|reason| StorageError::corrupt(path, offset, reason))
}
