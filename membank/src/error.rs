//! Error kinds produced by the memory bank, per the error table in the design
//! doc: `NotFound`, `PermissionDenied`, `StorageUnavailable`, `IndexCorruption`,
//! `ConflictUnresolvable`, `Timeout`, `ValidationError`, plus the lower-level
//! `Io`/`Parse`/`Internal` kinds the storage layer raises directly.

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// get/update/delete of an absent key.
    NotFound(String),

    /// Action disallowed by a namespace ACL.
    PermissionDenied(String),

    /// Backend I/O failed after exhausting retries.
    StorageUnavailable(String),

    /// An index read failed; caller should retry after a rebuild.
    IndexCorruption(String),

    /// A custom resolver rejected the merge.
    ConflictUnresolvable(String),

    /// The caller's deadline expired before the operation completed.
    Timeout(String),

    /// Malformed input, e.g. a vector embedding of the wrong length.
    ValidationError(String),

    /// Wraps `std::io::Error` from the storage layer.
    Io(String),

    /// A stored blob could not be decoded.
    Parse(String),

    /// Catch-all for invariants that should be unreachable.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Error::StorageUnavailable(msg) => write!(f, "storage unavailable: {msg}"),
            Error::IndexCorruption(msg) => write!(f, "index corruption: {msg}"),
            Error::ConflictUnresolvable(msg) => write!(f, "conflict unresolvable: {msg}"),
            Error::Timeout(msg) => write!(f, "timeout: {msg}"),
            Error::ValidationError(msg) => write!(f, "validation error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl Error {
    /// Whether the caller may retry this operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_) | Error::Timeout(_))
    }
}
