//! Error types for the sync engine

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::Op;
use crate::registry::WatchId;

/// Problems with the config file; all of them stop startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config line {line}: expected key=value")]
    Malformed { line: usize },
    #[error("config is missing required key `{0}`")]
    Missing(&'static str),
    #[error("config value for `{key}` is {len} bytes, limit is {max}")]
    TooLong {
        key: &'static str,
        len: usize,
        max: usize,
    },
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{} is outside sync root {}", path.display(), root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },
    #[error("sync root {} is not absolute", .0.display())]
    NotAbsolute(PathBuf),
    #[error("{} is not a relative path inside the root", .0.display())]
    NotRelative(PathBuf),
    #[error("sync root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot resolve {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Wire-level failures
///
/// Everything except `FieldTooLong` leaves the byte stream in an unknown
/// state, so the client closes the session when it sees one.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport failed: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected response magic {0:#04x}")]
    BadMagic(u8),
    #[error("response op {actual:#04x} does not answer {expected:?}")]
    OpMismatch { expected: Op, actual: u8 },
    #[error("unknown response status {0:#04x}")]
    UnknownStatus(u8),
    #[error("response declares {0} trailing bytes")]
    OversizedResponse(u32),
    #[error("login rejected by server")]
    AuthFailure,
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("session closed after an earlier protocol failure")]
    SessionClosed,
}

impl ProtocolError {
    /// Whether the session can no longer be used
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::FieldTooLong { .. })
    }
}

/// A watch id with no registered directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("watch {0} is not registered")]
pub struct NotWatched(pub WatchId);

/// A notification batch that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record at offset {offset} needs {needed} bytes, batch has {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("event source failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed notification batch: {0}")]
    Malformed(#[from] DecodeError),
}

/// Failure to synchronize one entry
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("server rejected {op:?} for {}", path.display())]
    Rejected { op: Op, path: PathBuf },
    #[error("cannot watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    NotWatched(#[from] NotWatched),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Events(#[from] WatchError),
}

impl SyncError {
    /// Whether the walk or dispatch loop has to stop
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(e) => e.is_fatal(),
            Self::Events(WatchError::Io(_)) => true,
            _ => false,
        }
    }
}
