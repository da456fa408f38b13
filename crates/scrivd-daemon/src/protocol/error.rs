//! Error types for the console protocol layer.

use std::io;

use thiserror::Error;

/// Maximum accepted length of one console line in bytes.
///
/// Console commands are short; the only sizable payloads are the
/// `updateroutetoken` JSON map and bearer tokens. The cap bounds memory
/// use on unauthenticated connections.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Errors for console protocol operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A line exceeded [`MAX_LINE_LEN`].
    #[error("line too long: {len} bytes exceeds maximum {max} bytes")]
    LineTooLong {
        /// Actual line length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Underlying I/O error on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for console protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
