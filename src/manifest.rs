//! Append-only catalog of live sstables.
//!
//! The manifest is a WAL for database structure instead of user data: every
//! sstable creation or retirement is one appended entry, and replaying the
//! file rebuilds the `level -> live tables` projection.
//!
//! # Entry format
//!
//! ```text
//! +---------+--------+------------+----------+-----------+---------+-----------+---------+-----------+
//! |total:u32|level:u8|fname_len:u8| filename |sk_len:u32 |start_key|ek_len:u32 | end_key |deleted:u8 |
//! +---------+--------+------------+----------+-----------+---------+-----------+---------+-----------+
//! ```
//!
//! `total` counts every byte after itself. All integers are big-endian.
//!
//! A database accumulates one manifest file per open that found none; on
//! open the lexicographically last `manifest_<db>_*` file wins. Appends are
//! not individually fsynced; the engine syncs once per flush or compaction
//! batch, always before deleting any file the manifest references.

use crate::error::{Error, Result};
use crate::files;
use crate::sstable::Metadata;
use crate::{corrupt, invariant};

use byteorder::{BigEndian, ReadBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// One catalog mutation: a table becoming live, or a live table retired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub metadata: Metadata,
    pub deleted: bool,
}

impl Entry {
    pub fn live(metadata: Metadata) -> Self {
        Self {
            metadata,
            deleted: false,
        }
    }

    pub fn deleted(metadata: Metadata) -> Self {
        Self {
            metadata,
            deleted: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let meta = &self.metadata;
        let total = 3 + meta.filename.len() + 4 + meta.start_key.len() + 4 + meta.end_key.len();

        let mut buf = Vec::with_capacity(4 + total);
        buf.extend_from_slice(&(total as u32).to_be_bytes());
        buf.push(meta.level);
        buf.push(meta.filename.len() as u8);
        buf.extend_from_slice(meta.filename.as_bytes());
        buf.extend_from_slice(&(meta.start_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&meta.start_key);
        buf.extend_from_slice(&(meta.end_key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&meta.end_key);
        buf.push(self.deleted as u8);
        buf
    }

    /// Decodes an entry body (everything after the total-length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut reader = body;

        let level = reader
            .read_u8()
            .map_err(|err| corrupt!("manifest entry truncated: {err}"))?;

        let filename_len = reader
            .read_u8()
            .map_err(|err| corrupt!("manifest entry truncated: {err}"))? as usize;
        let mut filename = vec![0u8; filename_len];
        reader
            .read_exact(&mut filename)
            .map_err(|err| corrupt!("manifest entry filename truncated: {err}"))?;
        let filename = String::from_utf8(filename)
            .map_err(|err| corrupt!("manifest entry filename is not utf-8: {err}"))?;

        let start_key_len = reader
            .read_u32::<BigEndian>()
            .map_err(|err| corrupt!("manifest entry truncated: {err}"))? as usize;
        let mut start_key = vec![0u8; start_key_len];
        reader
            .read_exact(&mut start_key)
            .map_err(|err| corrupt!("manifest entry start key truncated: {err}"))?;

        let end_key_len = reader
            .read_u32::<BigEndian>()
            .map_err(|err| corrupt!("manifest entry truncated: {err}"))? as usize;
        let mut end_key = vec![0u8; end_key_len];
        reader
            .read_exact(&mut end_key)
            .map_err(|err| corrupt!("manifest entry end key truncated: {err}"))?;

        let deleted = match reader
            .read_u8()
            .map_err(|err| corrupt!("manifest entry truncated: {err}"))?
        {
            0 => false,
            1 => true,
            other => return Err(corrupt!("manifest entry deleted byte is {other}")),
        };

        if !reader.is_empty() {
            return Err(corrupt!(
                "{} trailing bytes after manifest entry",
                reader.len()
            ));
        }

        Ok(Self {
            metadata: Metadata {
                level,
                filename,
                start_key,
                end_key,
            },
            deleted,
        })
    }
}

pub struct Manifest {
    file: File,
    path: PathBuf,
    /// Live tables per level, in manifest insertion order.
    levels: Vec<Vec<Metadata>>,
}

impl Manifest {
    /// Creates a fresh, empty manifest file.
    pub fn create(db_name: &str, db_dir: &Path) -> Result<Self> {
        let filename = files::generate_name(files::MANIFEST_PREFIX, db_name);
        let file = files::create_new(db_dir, &filename)?;
        Ok(Self {
            file,
            path: db_dir.join(filename),
            levels: Vec::new(),
        })
    }

    /// Opens the lexicographically last manifest for the database and
    /// replays it. Returns `None` when the database has no manifest yet.
    pub fn load_latest(db_name: &str, db_dir: &Path) -> Result<Option<Self>> {
        let matches = files::list_matching(db_dir, files::MANIFEST_PREFIX, db_name)?;
        let Some(path) = matches.into_iter().next_back() else {
            return Ok(None);
        };

        let mut levels = Vec::new();
        let mut reader = BufReader::new(File::open(&path)?);
        loop {
            let total = match reader.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            };
            let mut body = vec![0u8; total];
            reader
                .read_exact(&mut body)
                .map_err(|err| corrupt!("manifest entry truncated: {err}"))?;
            let entry = Entry::decode(&body)?;
            apply(&mut levels, &entry)?;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Some(Self { file, path, levels }))
    }

    /// Appends an entry to the file and applies it to the projection.
    pub fn add_entry(&mut self, entry: Entry) -> Result<()> {
        self.file.write_all(&entry.encode())?;
        apply(&mut self.levels, &entry)
    }

    /// Syncs appended entries to disk. Must run before any file referenced
    /// by the appended entries is deleted.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Live tables at the given level, in insertion order.
    pub fn metadata_for_level(&self, level: usize) -> &[Metadata] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest level ever observed, plus one.
    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn apply(levels: &mut Vec<Vec<Metadata>>, entry: &Entry) -> Result<()> {
    let level = entry.metadata.level as usize;
    while levels.len() <= level {
        levels.push(Vec::new());
    }

    if !entry.deleted {
        levels[level].push(entry.metadata.clone());
        return Ok(());
    }

    let position = levels[level]
        .iter()
        .position(|meta| meta.filename == entry.metadata.filename);
    match position {
        Some(idx) => {
            levels[level].remove(idx);
            Ok(())
        }
        None => Err(invariant!(
            "manifest deletes {} at level {level} but it is not live",
            entry.metadata.filename
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(level: u8, filename: &str, start: &[u8], end: &[u8]) -> Metadata {
        Metadata {
            level,
            filename: filename.to_string(),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
        }
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = Entry::live(meta(3, "sstable_db_1_000007", b"aaa", b"zzz"));
        let encoded = entry.encode();

        let total = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), 4 + total);
        assert_eq!(Entry::decode(&encoded[4..]).unwrap(), entry);

        let tombstoned = Entry::deleted(meta(0, "sstable_db_2_000008", b"k", b"k"));
        let encoded = tombstoned.encode();
        assert_eq!(Entry::decode(&encoded[4..]).unwrap(), tombstoned);
    }

    #[test]
    fn test_entry_bad_deleted_byte() {
        let entry = Entry::live(meta(0, "f", b"a", b"b"));
        let mut encoded = entry.encode();
        let last = encoded.len() - 1;
        encoded[last] = 9;
        assert!(matches!(
            Entry::decode(&encoded[4..]),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_projection_tracks_live_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::create("testdb", dir.path()).unwrap();

        let first = meta(0, "sst_a", b"a", b"m");
        let second = meta(0, "sst_b", b"n", b"z");
        manifest.add_entry(Entry::live(first.clone())).unwrap();
        manifest.add_entry(Entry::live(second.clone())).unwrap();

        assert_eq!(manifest.levels(), 1);
        assert_eq!(manifest.metadata_for_level(0), &[first.clone(), second.clone()]);
        assert!(manifest.metadata_for_level(3).is_empty());

        manifest.add_entry(Entry::deleted(first)).unwrap();
        assert_eq!(manifest.metadata_for_level(0), &[second]);
    }

    #[test]
    fn test_delete_of_non_live_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::create("testdb", dir.path()).unwrap();

        let result = manifest.add_entry(Entry::deleted(meta(0, "ghost", b"a", b"b")));
        assert!(matches!(result, Err(Error::InvariantViolated(_))));
    }

    #[test]
    fn test_replay_rebuilds_projection() {
        let dir = tempfile::tempdir().unwrap();

        let l0 = meta(0, "sst_l0", b"a", b"m");
        let l1 = meta(1, "sst_l1", b"a", b"z");
        {
            let mut manifest = Manifest::create("testdb", dir.path()).unwrap();
            manifest.add_entry(Entry::live(l0.clone())).unwrap();
            manifest.add_entry(Entry::live(l1.clone())).unwrap();
            manifest.add_entry(Entry::deleted(l0)).unwrap();
            manifest.sync().unwrap();
        }

        let manifest = Manifest::load_latest("testdb", dir.path())
            .unwrap()
            .expect("manifest should exist");
        assert_eq!(manifest.levels(), 2);
        assert!(manifest.metadata_for_level(0).is_empty());
        assert_eq!(manifest.metadata_for_level(1), &[l1]);
    }

    #[test]
    fn test_load_latest_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load_latest("testdb", dir.path())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_latest_picks_last_file() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut old = Manifest::create("testdb", dir.path()).unwrap();
            old.add_entry(Entry::live(meta(0, "old_table", b"a", b"b")))
                .unwrap();
            old.sync().unwrap();
        }
        {
            let mut new = Manifest::create("testdb", dir.path()).unwrap();
            new.add_entry(Entry::live(meta(0, "new_table", b"c", b"d")))
                .unwrap();
            new.sync().unwrap();
        }

        let manifest = Manifest::load_latest("testdb", dir.path())
            .unwrap()
            .expect("manifest should exist");
        assert_eq!(manifest.metadata_for_level(0).len(), 1);
        assert_eq!(manifest.metadata_for_level(0)[0].filename, "new_table");
    }

    #[test]
    fn test_appends_after_reload() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut manifest = Manifest::create("testdb", dir.path()).unwrap();
            manifest
                .add_entry(Entry::live(meta(0, "first", b"a", b"b")))
                .unwrap();
            manifest.sync().unwrap();
        }

        {
            let mut manifest = Manifest::load_latest("testdb", dir.path())
                .unwrap()
                .expect("manifest should exist");
            manifest
                .add_entry(Entry::live(meta(0, "second", b"c", b"d")))
                .unwrap();
            manifest.sync().unwrap();
        }

        let manifest = Manifest::load_latest("testdb", dir.path())
            .unwrap()
            .expect("manifest should exist");
        let names: Vec<_> = manifest
            .metadata_for_level(0)
            .iter()
            .map(|m| m.filename.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_truncated_entry_detected() {
        let dir = tempfile::tempdir().unwrap();

        let path = {
            let mut manifest = Manifest::create("testdb", dir.path()).unwrap();
            manifest
                .add_entry(Entry::live(meta(0, "table", b"a", b"b")))
                .unwrap();
            manifest.sync().unwrap();
            manifest.path().to_path_buf()
        };

        // Chop the tail off the only entry.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert!(matches!(
            Manifest::load_latest("testdb", dir.path()),
            Err(Error::CorruptRecord(_))
        ));
    }
}
