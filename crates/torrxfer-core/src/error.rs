//! Error types for torrxfer.
//!
//! A single error enum covers both halves of the pipeline. The client's
//! retry policy keys off [`Error::is_recoverable`]: recoverable errors
//! re-enqueue the job, everything else is terminal for that attempt.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for torrxfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for torrxfer.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured media root is not an ancestor of the watched directory
    #[error("invalid media root: '{media_root}' is not an ancestor of '{directory}'")]
    InvalidMediaRoot {
        /// Configured media root
        media_root: String,
        /// Watched directory
        directory: String,
    },

    /// File system watcher failure
    #[error("file watcher error: {0}")]
    WatcherError(String),

    /// Invalid or unsafe path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Could not reach or dial a server
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// Server address
        address: String,
        /// Underlying failure
        reason: String,
    },

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Malformed frame or payload on the wire
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A well-formed frame of the wrong type arrived
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type
        expected: String,
        /// Actual message type received
        actual: String,
    },

    /// The server refused or failed a query
    #[error("query rejected: {0}")]
    QueryFailed(String),

    /// The server reported a failure mid-stream
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// No active file is registered for a transfer stream
    #[error("no active file for client '{0}'")]
    NoActiveFile(String),

    /// A `*?*` text record could not be parsed
    #[error("malformed record: {0}")]
    RecordParse(String),

    /// Configuration file or environment error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Embedded store failure
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error is transient and the operation can be
    /// retried by re-enqueueing the job.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QueryFailed(_)
                | Self::TransferFailed(_)
                | Self::ConnectionFailed { .. }
                | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::QueryFailed("busy".into()).is_recoverable());
        assert!(Error::TransferFailed("reset".into()).is_recoverable());
        assert!(Error::Timeout(10).is_recoverable());
        assert!(!Error::InvalidPath("..".into()).is_recoverable());
        assert!(!Error::RecordParse("tokens".into()).is_recoverable());
    }
}
