//! Error types for the transport library.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::encoding::Encoding;

/// Errors that can occur while connecting or writing.
///
/// Failures on the connect and read paths are not returned to a caller;
/// they travel as the detail of [`StatusEvent::ErrorOccurred`](crate::StatusEvent).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Connection attempt timed out.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// `connect` was called outside of a Tokio runtime.
    #[error("No Tokio runtime available to drive the connection")]
    NoRuntime,

    /// Text could not be represented in the requested encoding.
    #[error("Cannot encode {character:?} at byte {position} as {encoding}")]
    Encoding {
        /// Target encoding.
        encoding: Encoding,
        /// First character that could not be encoded.
        character: char,
        /// Byte offset of that character in the source text.
        position: usize,
    },

    /// The write buffer could not be handed over to the transport.
    #[error("Write buffer could not be handed to the transport")]
    BufferAccess,

    /// The transport reported a hard error while writing.
    #[error("Transport write failed: {0}")]
    TransportWrite(#[source] io::Error),
}

impl Error {
    /// Returns the underlying I/O error, if this error carries one.
    #[must_use]
    pub const fn io_error(&self) -> Option<&io::Error> {
        match self {
            Self::Io(e) | Self::TransportWrite(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
