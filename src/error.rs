use std::fmt::Display;

/// nbdb errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Any file-system failure.
    IoError(String),
    /// CRC mismatch, malformed length, or an unknown record kind byte.
    CorruptRecord(String),
    /// Internal consistency failure, e.g. the manifest deleting a file that
    /// is not live. Fatal in this revision.
    InvariantViolated(String),
    /// Create was asked for a database directory that already exists.
    AlreadyExists(String),
    /// Open was asked for a database directory that does not exist.
    NotFound(String),
    /// The database directory is locked by another process.
    Locked(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IoError(msg) => write!(f, "io error: {msg}"),
            Error::CorruptRecord(msg) => write!(f, "corrupt record: {msg}"),
            Error::InvariantViolated(msg) => write!(f, "invariant violated: {msg}"),
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Locked(msg) => write!(f, "locked: {msg}"),
        }
    }
}

/// Constructs an Error::CorruptRecord from the given format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::CorruptRecord(format!($($args)*)) };
}

/// Constructs an Error::InvariantViolated from the given format string.
#[macro_export]
macro_rules! invariant {
    ($($args:tt)*) => { $crate::error::Error::InvariantViolated(format!($($args)*)) };
}

/// An nbdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IoError(err.to_string())
    }
}
