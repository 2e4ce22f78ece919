//! Point lookup over an sstable file.

use crate::codec::{self, FOOTER_LEN};
use crate::corrupt;
use crate::error::Result;

use std::cmp::Ordering;
use std::io::{Read, Seek, SeekFrom};

/// Searches one sstable for `key`.
///
/// Tri-state result: `None` means the table has no entry for the key,
/// `Some(None)` means its latest entry is a tombstone (callers must not
/// consult older tables), `Some(Some(value))` is a live value.
///
/// The sparse index bounds the work: the scan starts at the last index
/// anchor whose key is `<= key` and stops at the first record past the key
/// or at the end of the data section.
pub fn search<R: Read + Seek>(key: &[u8], reader: &mut R) -> Result<Option<Option<Vec<u8>>>> {
    reader.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let footer = codec::read_footer(reader)?;

    if footer.index_entries == 0 {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(footer.index_start_byte as u64))?;
    let mut anchor = codec::read_pointer(reader)?;

    // The whole file starts past the key. The engine's metadata range check
    // filters these files out before calling in; this is the residual guard.
    if anchor.key.as_slice() > key {
        return Ok(None);
    }

    // Walk forward while the next anchor still precedes (or is) the key.
    for _ in 1..footer.index_entries {
        let next = codec::read_pointer(reader)?;
        if next.key.as_slice() > key {
            break;
        }
        anchor = next;
    }

    reader.seek(SeekFrom::Start(anchor.start_byte as u64))?;
    loop {
        if reader.stream_position()? >= footer.index_start_byte as u64 {
            return Ok(None);
        }

        let record = codec::read_record(reader)?
            .ok_or_else(|| corrupt!("sstable data section ended before its index"))?;

        match record.key.as_slice().cmp(key) {
            Ordering::Less => continue,
            Ordering::Greater => return Ok(None),
            Ordering::Equal => {
                return Ok(Some(if record.is_tombstone() {
                    None
                } else {
                    Some(record.value)
                }))
            }
        }
    }
}
