//! Crate-wide error type.
//!
//! The wire codec, the connection framer, and the context orchestrator all
//! report failures through this one enum, the way the teacher's
//! `ClientError` collects both its own I/O concerns and the lower-level
//! `ProtocolError` into a single caller-facing type.

use thiserror::Error;

/// Errors produced by any operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Null/misuse inputs, e.g. an empty format string where one is required.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The format string itself could not be scanned into directives.
    #[error("invalid format string: {0}")]
    InvalidFormat(String),

    /// A format directive did not match the tag found on the wire.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the format string called for.
        expected: String,
        /// What tag was actually read.
        found: String,
    },

    /// The payload was malformed: a string missing its NUL terminator, an
    /// embedded NUL, or an fd list shorter than the format string's fd tags.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A framing failure: bad magic, undersized or oversized header.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// An encoder input exceeded a hard limit (string, buffer, or message
    /// size).
    #[error("value too large: {0}")]
    TooLarge(String),

    /// A send was attempted on a client context with no live connection.
    #[error("not connected")]
    NotConnected,

    /// An operation was attempted on a resource that is mid-teardown.
    #[error("busy")]
    Busy,

    /// `wait_and_process` expired with no work to report.
    #[error("timeout")]
    Timeout,

    /// An underlying OS error, with the original `io::Error` preserved.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A requested operation is not supported, e.g. fd-passing over a
    /// non-local socket.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
