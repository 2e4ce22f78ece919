//! Immutable sorted table files.
//!
//! An sstable has three sections, in file order: the data section (encoded
//! records sorted ascending by key), a sparse index (one pointer per
//! [`INDEX_INTERVAL`]-th record, the first record always included), and the
//! fixed 12-byte footer locating the index. The layouts live in
//! [`codec`](crate::codec).

pub mod builder;
pub mod merger;
pub mod search;

use crate::codec::{self, Footer, RecordPointer};
use crate::error::Result;
use crate::files;

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One index pointer is emitted for every N-th record written.
pub const INDEX_INTERVAL: usize = 1000;

/// Catalog entry describing one live sstable file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub level: u8,
    pub filename: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Metadata {
    /// Whether `start_key <= key <= end_key` byte-lexicographically.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_slice() <= key && key <= self.end_key.as_slice()
    }
}

/// Creates a fresh sstable file, returning the handle and its filename.
pub fn create_file(db_name: &str, db_dir: &Path) -> Result<(File, String)> {
    let filename = files::generate_name(files::SSTABLE_PREFIX, db_name);
    let file = files::create_new(db_dir, &filename)?;
    Ok((file, filename))
}

/// Writes the index section and footer that close out a data section ending
/// at `index_start` bytes.
pub(crate) fn write_index_and_footer<W: Write>(
    writer: &mut W,
    pointers: &[RecordPointer],
    index_start: u32,
) -> Result<()> {
    let mut first_index_length = 0u32;
    for pointer in pointers {
        let encoded = codec::encode_pointer(pointer);
        if first_index_length == 0 {
            first_index_length = encoded.len() as u32;
        }
        writer.write_all(&encoded)?;
    }

    let footer = Footer {
        index_start_byte: index_start,
        first_index_length,
        index_entries: pointers.len() as u32,
    };
    writer.write_all(&codec::encode_footer(&footer))?;
    Ok(())
}
