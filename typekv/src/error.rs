//! Error types shared by every layer of the crate, from the raw byte
//! `Engine` up through the collection runtime and atomic builder.

use std::fmt;

/// The crate-wide result alias. Nearly every fallible operation in
/// `typekv` returns this.
pub type CResult<T> = Result<T, Error>;

/// Errors surfaced to callers as `Err`.
///
/// `CommitFailure` (optimistic-concurrency or uniqueness rejection) is
/// deliberately *not* a variant here: a failed commit is returned as a
/// value (`Ok(CommitOutcome::Conflict)`), never as an exception. See
/// `crate::kv::atomic::CommitOutcome`.
#[derive(Debug)]
pub enum Error {
    /// A value failed `Model::validate` before being written.
    Validation(String),

    /// `update` was called against an id that does not exist.
    NotFound(String),

    /// Encoding, decoding, or raw storage I/O failure.
    Backend(String),

    /// A key part, or a composed key, could not be encoded or exceeded a
    /// backend size limit.
    Key(String),

    /// Wraps an I/O error from a disk-backed `Engine`.
    Io(String),

    /// A background task (watcher, queue listener, interval, cron) failed
    /// in a way that isn't any of the above.
    Internal(String),

    /// A value of the wrong shape was supplied where a specific one was
    /// expected (e.g. a non-u64 operand to `sum`/`min`/`max`).
    Value(String),

    /// A codec failed to parse its input.
    Parse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "validation error: {msg}"),
            Error::NotFound(id) => write!(f, "not found: {id}"),
            Error::Backend(msg) => write!(f, "backend error: {msg}"),
            Error::Key(msg) => write!(f, "key error: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Value(msg) => write!(f, "value error: {msg}"),
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {err}"))
    }
}
