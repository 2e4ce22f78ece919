//! K-way merge of sstables into the next level.

use crate::codec::{self, Record, RecordPointer, FOOTER_LEN};
use crate::corrupt;
use crate::error::Result;
use crate::sstable::{self, Metadata, INDEX_INTERVAL};

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

/// Rotate to a new output file once the running data size exceeds this.
pub const MAX_OUTPUT_SIZE: u32 = 2 * 1024 * 1024;

/// Merges a set of sstables into new tables at `target_level`.
///
/// Inputs must be ordered most recent first: when the same key appears in
/// several inputs, the earliest input in the list supplies the surviving
/// record and the older duplicates are dropped. Tombstones are ordinary
/// records here and survive the merge.
pub struct Merger<'a> {
    inputs: &'a [Metadata],
    target_level: u8,
    db_name: &'a str,
    db_dir: &'a Path,
    max_output_size: u32,
    index_interval: usize,
}

impl<'a> Merger<'a> {
    pub fn new(inputs: &'a [Metadata], target_level: u8, db_name: &'a str, db_dir: &'a Path) -> Self {
        Self {
            inputs,
            target_level,
            db_name,
            db_dir,
            max_output_size: MAX_OUTPUT_SIZE,
            index_interval: INDEX_INTERVAL,
        }
    }

    /// Overrides the rotation threshold. Tests use this to force multi-file
    /// output without writing megabytes.
    pub(crate) fn max_output_size(mut self, bytes: u32) -> Self {
        self.max_output_size = bytes;
        self
    }

    /// Runs the merge, returning metadata for every output file written.
    pub fn merge(self) -> Result<Vec<Metadata>> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for meta in self.inputs {
            inputs.push(Input::open(&self.db_dir.join(&meta.filename))?);
        }

        let mut outputs: Vec<Metadata> = Vec::new();
        let mut current: Option<Output> = None;

        loop {
            // Pick the input holding the smallest key; ties go to the
            // earliest (most recent) input.
            let mut winner: Option<usize> = None;
            for i in 0..inputs.len() {
                let Some(candidate) = inputs[i].current.as_ref() else {
                    continue;
                };
                let better = match winner {
                    None => true,
                    Some(best) => match inputs[best].current.as_ref() {
                        Some(best) => candidate.key < best.key,
                        None => true,
                    },
                };
                if better {
                    winner = Some(i);
                }
            }
            let Some(winner) = winner else { break };

            let record = match inputs[winner].current.take() {
                Some(record) => record,
                None => break,
            };
            inputs[winner].advance()?;

            // Drop shadowed duplicates from older inputs. Keys within one
            // file are strictly increasing, so a single advance suffices.
            for (i, input) in inputs.iter_mut().enumerate() {
                if i == winner {
                    continue;
                }
                if matches!(&input.current, Some(dup) if dup.key == record.key) {
                    input.advance()?;
                }
            }

            let mut out = match current.take() {
                Some(out) => out,
                None => Output::create(self.db_name, self.db_dir)?,
            };
            out.push(&record, self.index_interval)?;

            if out.written > self.max_output_size {
                outputs.push(out.finish(self.target_level)?);
            } else {
                current = Some(out);
            }
        }

        if let Some(last) = current.take() {
            outputs.push(last.finish(self.target_level)?);
        }

        tracing::debug!(
            inputs = self.inputs.len(),
            outputs = outputs.len(),
            target_level = self.target_level,
            "merge complete"
        );

        Ok(outputs)
    }
}

/// One open input file, positioned within its data section.
struct Input {
    reader: File,
    /// Offset where the data section ends and the index begins.
    stop_byte: u32,
    current: Option<Record>,
}

impl Input {
    fn open(path: &Path) -> Result<Self> {
        let mut reader = File::open(path)?;

        reader.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let footer = codec::read_footer(&mut reader)?;

        reader.seek(SeekFrom::Start(0))?;
        let mut input = Self {
            reader,
            stop_byte: footer.index_start_byte,
            current: None,
        };
        input.advance()?;
        Ok(input)
    }

    fn advance(&mut self) -> Result<()> {
        if self.reader.stream_position()? >= self.stop_byte as u64 {
            self.current = None;
            return Ok(());
        }
        self.current = Some(
            codec::read_record(&mut self.reader)?
                .ok_or_else(|| corrupt!("sstable data section ended before its index"))?,
        );
        Ok(())
    }
}

/// One output file in progress.
struct Output {
    file: File,
    filename: String,
    written: u32,
    count: usize,
    pointers: Vec<RecordPointer>,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
}

impl Output {
    fn create(db_name: &str, db_dir: &Path) -> Result<Self> {
        let (file, filename) = sstable::create_file(db_name, db_dir)?;
        Ok(Self {
            file,
            filename,
            written: 0,
            count: 0,
            pointers: Vec::new(),
            start_key: Vec::new(),
            end_key: Vec::new(),
        })
    }

    fn push(&mut self, record: &Record, index_interval: usize) -> Result<()> {
        use std::io::Write;

        let frame = codec::encode_record(record);
        self.file.write_all(&frame)?;

        if self.count % index_interval == 0 {
            self.pointers.push(RecordPointer {
                key: record.key.clone(),
                start_byte: self.written,
                length: frame.len() as u32,
            });
        }

        if self.count == 0 {
            self.start_key = record.key.clone();
        }
        self.end_key = record.key.clone();

        self.written += frame.len() as u32;
        self.count += 1;
        Ok(())
    }

    fn finish(mut self, level: u8) -> Result<Metadata> {
        sstable::write_index_and_footer(&mut self.file, &self.pointers, self.written)?;
        self.file.sync_all()?;

        Ok(Metadata {
            level,
            filename: self.filename,
            start_key: self.start_key,
            end_key: self.end_key,
        })
    }
}
