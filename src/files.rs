//! Naming and creation of the on-disk files in a database directory.
//!
//! Every generated file is `<prefix>_<db>_<unix_seconds>_<seq>`, where `seq`
//! is a process-wide counter. Seconds alone collide under rapid creation
//! (compaction can rotate several sstables in one second); the zero-padded
//! sequence restores uniqueness and keeps lexicographic ordering stable
//! within a second, which "last manifest wins" relies on.

use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const WAL_PREFIX: &str = "wal";
pub const SSTABLE_PREFIX: &str = "sstable";
pub const MANIFEST_PREFIX: &str = "manifest";

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produces a fresh `<prefix>_<db>_<secs>_<seq>` filename.
pub fn generate_name(prefix: &str, db_name: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let seq = NEXT_SEQ.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}_{db_name}_{secs}_{seq:06}")
}

/// Creates a new file under `db_dir`, failing if it somehow already exists.
pub fn create_new(db_dir: &Path, filename: &str) -> Result<File> {
    let path = db_dir.join(filename);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                Error::IoError(format!("file {} already exists", path.display()))
            } else {
                err.into()
            }
        })
}

/// Lists files in `db_dir` matching `<prefix>_<db>_*`, sorted by name.
pub fn list_matching(db_dir: &Path, prefix: &str, db_name: &str) -> Result<Vec<PathBuf>> {
    let wanted = format!("{prefix}_{db_name}_");
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(db_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&wanted) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    Ok(matches)
}
