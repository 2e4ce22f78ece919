use std::path::PathBuf;

/// Default root for database directories.
const DEFAULT_DATA_DIR: &str = "/usr/local/var/nbdb";

/// Freeze the active memtable once its approximate size crosses this.
const DEFAULT_MEMTABLE_SIZE_LIMIT: u32 = 4 * 1024 * 1024;

/// Open-time options for a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root directory under which each database gets its own subdirectory.
    pub data_dir: PathBuf,

    /// Approximate memtable byte size that triggers a freeze-and-flush.
    pub memtable_size_limit: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            memtable_size_limit: DEFAULT_MEMTABLE_SIZE_LIMIT,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the memtable flush threshold in bytes.
    pub fn memtable_size_limit(mut self, bytes: u32) -> Self {
        self.memtable_size_limit = bytes;
        self
    }
}
