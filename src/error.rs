//! Crate-wide error taxonomy.
//!
//! The runtime groups failures into the four kinds described by the design:
//! resource exhaustion, I/O, protocol violations and caller misuse. Resource
//! errors are also recorded as a sticky flag on the memory block chain (see
//! [`crate::memory`]); the variants here are what gets handed back to the
//! caller at an API boundary.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MprError>;

/// The kind of failure, independent of the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out of memory.
    OutOfMemory,
    /// A heap's `max_memory` quota was exceeded.
    QuotaExceeded,
    /// The process or a subsystem ran out of file descriptors / handler slots.
    FdExhausted,
    /// A wait service or dispatcher table is full.
    TooManyHandlers,
    /// The remote end refused the connection.
    ConnectionRefused,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// The operation would block; not a real error, used to request a retry.
    WouldBlock,
    /// An operation did not complete before its deadline.
    Timeout,
    /// A malformed HTTP header or status line.
    BadHeader,
    /// A malformed chunked-transfer chunk header.
    BadChunk,
    /// The URL names a scheme the client cannot speak.
    UnsupportedScheme,
    /// Authentication failed (missing credentials, bad digest, etc).
    AuthFailed,
    /// An invalid handle was passed to an API.
    BadHandle,
    /// The object is not in a state that permits the requested operation.
    BadState,
    /// An argument failed validation.
    BadArgument,
    /// A filesystem provider refused a write (e.g. the ROM provider).
    ReadOnly,
    /// The provider has no notion of this operation at all (e.g. links on
    /// an in-memory ROM image), as opposed to refusing a write it otherwise
    /// understands.
    Unsupported,
    /// Wraps a `std::io::Error` that doesn't fit a more specific kind.
    Io,
}

/// An error produced by any MPR subsystem.
#[derive(Debug)]
pub struct MprError {
    kind: ErrorKind,
    message: String,
    source: Option<io::Error>,
}

impl MprError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        MprError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_io(kind: ErrorKind, err: io::Error) -> Self {
        MprError {
            message: err.to_string(),
            kind,
            source: Some(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_would_block(&self) -> bool {
        self.kind == ErrorKind::WouldBlock
    }

    /// A human string combining the protocol error or a status-code message,
    /// as required for `mpr_http_error()`-style reporting.
    pub fn describe(&self) -> String {
        format!("{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Display for MprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MprError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for MprError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            _ => ErrorKind::Io,
        };
        MprError::from_io(kind, err)
    }
}

impl From<MprError> for io::Error {
    fn from(err: MprError) -> Self {
        match err.kind {
            ErrorKind::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, err.message),
            ErrorKind::Timeout => io::Error::new(io::ErrorKind::TimedOut, err.message),
            ErrorKind::ConnectionRefused => {
                io::Error::new(io::ErrorKind::ConnectionRefused, err.message)
            }
            ErrorKind::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, err.message)
            }
            _ => io::Error::other(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_would_block() {
        let io_err = io::Error::from(io::ErrorKind::WouldBlock);
        let err: MprError = io_err.into();
        assert!(err.is_would_block());
    }

    #[test]
    fn describe_combines_kind_and_message() {
        let err = MprError::new(ErrorKind::BadChunk, "chunk extension too long");
        assert_eq!(err.describe(), "BadChunk: chunk extension too long");
    }
}
