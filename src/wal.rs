//! Write-ahead log for durability and crash recovery.
//!
//! Every mutation is appended and fsynced here before the memtable is
//! touched, so a successful `put`/`delete` survives process death. Each live
//! memtable is paired with exactly one WAL file; the pair is created
//! together at open or freeze time and retired together once the memtable's
//! contents are durable in an sstable.
//!
//! The file is a plain sequence of the record frames defined in [`codec`](crate::codec),
//! in write order, with no header. Replay reads frames until a clean EOF and
//! reports a torn or corrupted tail as `CorruptRecord`.

use crate::codec::{self, Record};
use crate::error::Result;
use crate::files;
use crate::memtable::{MemStore, Memtable};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

pub struct Wal {
    file: File,
    path: PathBuf,
    size: u32,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl Wal {
    /// Creates a fresh WAL file for the database.
    pub fn create(db_name: &str, db_dir: &Path) -> Result<Self> {
        let filename = files::generate_name(files::WAL_PREFIX, db_name);
        let file = files::create_new(db_dir, &filename)?;
        Ok(Self {
            file,
            path: db_dir.join(filename),
            size: 0,
        })
    }

    /// Reopens an existing WAL file for appending.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(&path)?;
        let size = file.metadata()?.len() as u32;
        Ok(Self { file, path, size })
    }

    /// Paths of all WAL files for the database, sorted by name (oldest
    /// first, given the monotonic name components).
    pub fn find_existing(db_name: &str, db_dir: &Path) -> Result<Vec<PathBuf>> {
        files::list_matching(db_dir, files::WAL_PREFIX, db_name)
    }

    /// Appends one record and syncs it to disk before returning.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let frame = codec::encode_record(record);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.size += frame.len() as u32;
        Ok(())
    }

    /// Iterates the log from the start, decoding each record.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path)
    }

    /// Replays the log into a memtable, applying updates and tombstones.
    pub fn restore_into<S: MemStore>(&self, memtable: &mut Memtable<S>) -> Result<()> {
        for record in self.replay()? {
            memtable.apply(record?);
        }
        Ok(())
    }

    /// Deletes the log file, consuming the handle.
    pub fn remove(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
}

impl ReplayIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        codec::read_record(&mut self.reader).transpose()
    }
}
