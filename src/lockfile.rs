use crate::error::{Error, Result};

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the lock file inside a database directory.
pub const LOCK_FILE: &str = "__DB_LOCK__";

/// Exclusive per-directory lock, represented by a file holding the owning
/// process id as ASCII.
///
/// Locking is advisory: a second open of the same directory reads the file
/// and refuses unless the recorded pid is its own. A reopen by the owning
/// process (e.g. after a crash-restart test that never released the lock)
/// therefore succeeds.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock for the given database directory.
    pub fn acquire(db_dir: &Path) -> Result<Self> {
        let path = db_dir.join(LOCK_FILE);
        let pid = std::process::id();

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())?;
                file.sync_all()?;
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let contents = std::fs::read_to_string(&path)?;
                let owner: u32 = contents
                    .trim()
                    .parse()
                    .map_err(|_| Error::Locked(format!("unreadable pid in {}", path.display())))?;
                if owner == pid {
                    Ok(Self { path })
                } else {
                    Err(Error::Locked(format!(
                        "database locked by another process ({owner})"
                    )))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Releases the lock by removing the file.
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
