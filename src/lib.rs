//! nbdb is an embedded, single-writer, ordered key-value store built on the
//! log-structured merge-tree pattern. Keys and values are opaque byte
//! sequences; keys order lexicographically.
//!
//! Writes land in a write-ahead log and an in-memory skip list; full
//! memtables freeze and flush to immutable sorted table files, which a
//! background task merges down a level hierarchy. A manifest log records
//! which tables are live.
//!
//! ```no_run
//! use nbdb::{Db, Options};
//!
//! # async fn example() -> nbdb::Result<()> {
//! let db = Db::open_or_create("example", Options::new().data_dir("/tmp/nbdb"))?;
//! db.put(b"howdy", b"time")?;
//! assert_eq!(db.get(b"howdy")?, Some(b"time".to_vec()));
//! db.delete(b"howdy")?;
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
mod files;
pub mod lockfile;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::Options;
pub use db::{Db, Stats};
pub use error::{Error, Result};
