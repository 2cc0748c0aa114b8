//! Engine error types

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transport-level failure (DNS, connect, reset, body read)
    #[error("http error: {0}")]
    Http(String),

    /// No response or no body bytes within the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with status code {0}")]
    Status(u16),

    #[error("redirect status {0} received without Location header")]
    RedirectWithoutLocation(u16),

    #[error("maximum redirects ({0}) exceeded")]
    TooManyRedirects(usize),

    /// The server answered a ranged request with the whole resource
    #[error("server ignored range request starting at byte {0}")]
    RangeIgnored(u64),

    #[error("response ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("segment file not found: {}", .0.display())]
    MissingSegment(PathBuf),

    #[error("segment {id} has {actual} bytes on disk, expected {expected}")]
    SegmentLength { id: usize, expected: u64, actual: u64 },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("download failed due to segment errors")]
    SegmentsFailed,

    #[error("transfer {0} not found")]
    UnknownTransfer(String),

    #[error("transfer {0} is already registered")]
    DuplicateTransfer(String),

    /// The task actor has stopped and no longer accepts commands
    #[error("transfer task has shut down")]
    TaskClosed,
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
