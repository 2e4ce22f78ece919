//! Wire formats shared by the WAL and the sstable files.
//!
//! Three serial forms, all big-endian:
//!
//! ```text
//! Record (WAL entries and sstable data section):
//! +------------+-----------+-----+------+--------------------+---------+
//! |total_len   |key_len:u32| key |kind  | [val_len:u32, val] |crc32:u32|
//! +------------+-----------+-----+------+--------------------+---------+
//!  total_len counts every byte after itself, checksum included.
//!  The value fields are present only for Update records.
//!  crc32 (IEEE) covers key_len through value.
//!
//! RecordPointer (sstable sparse index):
//! +-----------+-----+--------------+----------+
//! |key_len:u32| key |start_byte:u32|length:u32|
//! +-----------+-----+--------------+----------+
//!
//! Footer (fixed 12 bytes, the last 12 bytes of an sstable):
//! +------------------+--------------------+----------------+
//! |index_start:u32   |first_index_len:u32 |index_entries:u32|
//! +------------------+--------------------+----------------+
//! ```

use crate::corrupt;
use crate::error::Result;

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};
use std::io::Read;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Serialized size of a footer.
pub const FOOTER_LEN: u64 = 12;

const KIND_UPDATE: u8 = 0;
const KIND_DELETE: u8 = 1;

/// Whether a record carries a value or shadows one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Update,
    Delete,
}

impl RecordKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            KIND_UPDATE => Ok(RecordKind::Update),
            KIND_DELETE => Ok(RecordKind::Delete),
            other => Err(corrupt!("unknown record kind {other}")),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            RecordKind::Update => KIND_UPDATE,
            RecordKind::Delete => KIND_DELETE,
        }
    }
}

/// A single mutation: an insert/update, or a tombstone shadowing a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub kind: RecordKind,
}

impl Record {
    pub fn update(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            kind: RecordKind::Update,
        }
    }

    /// A tombstone carries no value.
    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            key,
            value: Vec::new(),
            kind: RecordKind::Delete,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Delete
    }
}

/// A pointer to a record within an sstable's data section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordPointer {
    pub key: Vec<u8>,
    /// Byte offset of the record within the file.
    pub start_byte: u32,
    /// Length of the record, including its total_length prefix.
    pub length: u32,
}

/// The fixed trailer of an sstable, locating its sparse index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub index_start_byte: u32,
    pub first_index_length: u32,
    pub index_entries: u32,
}

/// Encodes a record into its length-prefixed, CRC-protected frame.
pub fn encode_record(record: &Record) -> Vec<u8> {
    // kind byte + key length field + key + checksum
    let mut total_len = 1 + 4 + record.key.len() + 4;
    if record.kind == RecordKind::Update {
        total_len += 4 + record.value.len();
    }

    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.extend_from_slice(&(record.key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&record.key);
    buf.push(record.kind.as_byte());
    if record.kind == RecordKind::Update {
        buf.extend_from_slice(&(record.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&record.value);
    }

    let checksum = CRC32.checksum(&buf[4..]);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf
}

/// Size of the encoded frame for a record, total_length prefix included.
pub fn encoded_len(record: &Record) -> u32 {
    let mut len = 4 + 1 + 4 + record.key.len() as u32 + 4;
    if record.kind == RecordKind::Update {
        len += 4 + record.value.len() as u32;
    }
    len
}

/// Decodes a full record frame, total_length prefix included.
pub fn decode_record(frame: &[u8]) -> Result<Record> {
    if frame.len() < 4 {
        return Err(corrupt!("record frame shorter than its length prefix"));
    }
    let total_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = frame
        .get(4..4 + total_len)
        .ok_or_else(|| corrupt!("record length {total_len} overruns buffer of {}", frame.len()))?;
    decode_record_body(body)
}

/// Decodes the body of a record frame: everything after the total_length
/// prefix, checksum included.
pub fn decode_record_body(body: &[u8]) -> Result<Record> {
    // key length + kind + checksum is the smallest possible body
    if body.len() < 9 {
        return Err(corrupt!("record body of {} bytes is too short", body.len()));
    }

    let (payload, crc_bytes) = body.split_at(body.len() - 4);
    let stored = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = CRC32.checksum(payload);
    if computed != stored {
        return Err(corrupt!(
            "record checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        ));
    }

    let key_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let rest = payload
        .get(4..)
        .filter(|rest| rest.len() > key_len)
        .ok_or_else(|| corrupt!("key length {key_len} overruns record payload"))?;
    let key = rest[..key_len].to_vec();

    let kind = RecordKind::from_byte(rest[key_len])?;
    let tail = &rest[key_len + 1..];

    let value = match kind {
        RecordKind::Delete => {
            if !tail.is_empty() {
                return Err(corrupt!("{} trailing bytes after tombstone", tail.len()));
            }
            Vec::new()
        }
        RecordKind::Update => {
            if tail.len() < 4 {
                return Err(corrupt!("record payload truncated before value length"));
            }
            let value_len = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as usize;
            let value = tail
                .get(4..4 + value_len)
                .ok_or_else(|| corrupt!("value length {value_len} overruns record payload"))?;
            if tail.len() != 4 + value_len {
                return Err(corrupt!(
                    "{} trailing bytes after value",
                    tail.len() - 4 - value_len
                ));
            }
            value.to_vec()
        }
    };

    Ok(Record { key, value, kind })
}

/// Reads the next record frame from a stream. Returns `Ok(None)` on a clean
/// end-of-stream at a frame boundary.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let total_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut body = vec![0u8; total_len];
    reader
        .read_exact(&mut body)
        .map_err(|err| corrupt!("record truncated mid-frame: {err}"))?;

    decode_record_body(&body).map(Some)
}

/// Encodes an index pointer.
pub fn encode_pointer(pointer: &RecordPointer) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + pointer.key.len());
    buf.extend_from_slice(&(pointer.key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&pointer.key);
    buf.extend_from_slice(&pointer.start_byte.to_be_bytes());
    buf.extend_from_slice(&pointer.length.to_be_bytes());
    buf
}

/// Reads one index pointer from a stream.
pub fn read_pointer<R: Read>(reader: &mut R) -> Result<RecordPointer> {
    let key_len = reader.read_u32::<BigEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    reader
        .read_exact(&mut key)
        .map_err(|err| corrupt!("index pointer key truncated: {err}"))?;
    let start_byte = reader.read_u32::<BigEndian>()?;
    let length = reader.read_u32::<BigEndian>()?;
    Ok(RecordPointer {
        key,
        start_byte,
        length,
    })
}

/// Encodes a footer into its fixed 12 bytes.
pub fn encode_footer(footer: &Footer) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&footer.index_start_byte.to_be_bytes());
    buf[4..8].copy_from_slice(&footer.first_index_length.to_be_bytes());
    buf[8..12].copy_from_slice(&footer.index_entries.to_be_bytes());
    buf
}

/// Reads the footer from a stream positioned at its first byte.
pub fn read_footer<R: Read>(reader: &mut R) -> Result<Footer> {
    let index_start_byte = reader.read_u32::<BigEndian>()?;
    let first_index_length = reader.read_u32::<BigEndian>()?;
    let index_entries = reader.read_u32::<BigEndian>()?;
    Ok(Footer {
        index_start_byte,
        first_index_length,
        index_entries,
    })
}
