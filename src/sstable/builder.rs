//! Writes a sorted run of records out as an sstable.

use crate::codec::{self, Record, RecordPointer};
use crate::error::Result;
use crate::sstable::{self, Metadata, INDEX_INTERVAL};

use std::io::Write;

/// Builds one sstable from an in-order record iterator.
pub struct Builder<W: Write> {
    writer: W,
    filename: String,
    level: u8,
    index_interval: usize,
}

impl<W: Write> Builder<W> {
    pub fn new(filename: String, level: u8, writer: W) -> Self {
        Self {
            writer,
            filename,
            level,
            index_interval: INDEX_INTERVAL,
        }
    }

    /// Overrides the sparse-index interval. Tests use this to exercise
    /// multi-anchor index walks without writing thousands of records.
    pub(crate) fn index_interval(mut self, interval: usize) -> Self {
        self.index_interval = interval;
        self
    }

    /// Consumes the iterator, writing the data section, sparse index, and
    /// footer. Returns metadata spanning the first and last keys written.
    pub fn build<I>(mut self, records: I) -> Result<Metadata>
    where
        I: Iterator<Item = Record>,
    {
        let mut written = 0u32;
        let mut count = 0usize;
        let mut pointers: Vec<RecordPointer> = Vec::new();
        let mut start_key: Option<Vec<u8>> = None;
        let mut end_key: Vec<u8> = Vec::new();

        for record in records {
            let frame = codec::encode_record(&record);
            self.writer.write_all(&frame)?;

            if count % self.index_interval == 0 {
                pointers.push(RecordPointer {
                    key: record.key.clone(),
                    start_byte: written,
                    length: frame.len() as u32,
                });
            }

            if start_key.is_none() {
                start_key = Some(record.key.clone());
            }
            end_key = record.key;

            written += frame.len() as u32;
            count += 1;
        }

        sstable::write_index_and_footer(&mut self.writer, &pointers, written)?;
        self.writer.flush()?;

        Ok(Metadata {
            level: self.level,
            filename: self.filename,
            start_key: start_key.unwrap_or_default(),
            end_key,
        })
    }
}
