//! Error taxonomy shared by the WebSocket and SSE surfaces.

use std::{io, str::Utf8Error, string::FromUtf8Error};

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level library error.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection's close latch is set; every later read or write on it
    /// reports this. Also returned by a read that observed the peer's close
    /// frame, which is the clean end of a session.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The hub has been shut down; no further registrations or broadcasts
    /// are accepted.
    #[error("Hub closed")]
    HubClosed,

    /// The SSE response sink rejected the initial flush, so events could
    /// never reach the client unbuffered.
    #[error("Response writer does not support flushing")]
    NoFlusher,

    /// An error from the underlying byte stream.
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    /// A violation of the WebSocket wire protocol.
    #[error("Protocol Error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The HTTP upgrade could not be completed.
    #[error("Handshake Error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Text payload data was not well-formed UTF-8.
    #[error("UTF-8 Error: {0}")]
    Utf8(String),

    /// A frame or message exceeded a configured size limit.
    #[error("Capacity Error: {0}")]
    Capacity(#[from] CapacityError),

    /// The message's type does not fit the operation, e.g. a binary message
    /// surfaced to `read_text`.
    #[error("Invalid message type for this operation")]
    InvalidMessageType,

    /// JSON encoding or decoding failed in one of the convenience helpers.
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally invalid HTTP seen while building handshake types.
    #[error("HTTP Error: {0}")]
    Http(#[from] http::Error),
}

impl Error {
    /// Whether this error marks a clean close: the peer completed (or we
    /// initiated) the close handshake, as opposed to an abrupt disconnect.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }

    /// Whether the failed operation may be retried. Only transient I/O
    /// conditions qualify; protocol violations and closed sessions never do.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Error::Utf8(value.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(value: FromUtf8Error) -> Self {
        Error::Utf8(value.to_string())
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        match value {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            other => Error::Handshake(HandshakeError::Parse(other.to_string())),
        }
    }
}

/// Violations of RFC 6455 framing rules.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// Opcode outside the six values defined by RFC 6455 Section 5.2.
    #[error("Invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// One of RSV1-3 was set without a negotiated extension.
    #[error("Reserved bits must be zero")]
    ReservedBits,

    /// A control frame arrived with the FIN bit clear.
    #[error("Control frame must not be fragmented")]
    ControlFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("Control frame payload too large")]
    ControlTooLarge,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("Continuation frame without open fragmentation context")]
    UnexpectedContinuation,

    /// A text or binary frame arrived while a fragmented message was still
    /// being reassembled.
    #[error("Expected continuation frame")]
    ExpectedContinuation,

    /// A client-to-server frame arrived unmasked (RFC 6455 Section 5.1).
    #[error("Client frames must be masked")]
    MaskRequired,

    /// A server-to-client frame arrived masked (RFC 6455 Section 5.1).
    #[error("Server frames must not be masked")]
    MaskUnexpected,

    /// A close frame carried a one-byte payload, which cannot hold a status
    /// code.
    #[error("Invalid close frame payload")]
    InvalidCloseFrame,

    /// A 64-bit payload length had its most significant bit set.
    #[error("Invalid payload length encoding")]
    InvalidLength,
}

/// Failures of the HTTP upgrade, each mapping to one missing or malformed
/// part of the request (or, for the dialer, the response).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum HandshakeError {
    /// Request method was not GET (RFC 6455 Section 4.1).
    #[error("Method must be GET")]
    InvalidMethod,

    /// Request used an HTTP version below 1.1.
    #[error("Unsupported HTTP version (must be at least HTTP/1.1)")]
    InvalidHttpVersion,

    /// `Upgrade` header missing or lacking the `websocket` token.
    #[error("Missing 'Upgrade: websocket' header")]
    MissingUpgrade,

    /// `Connection` header missing or lacking the `upgrade` token.
    #[error("Missing 'Connection: Upgrade' header")]
    MissingConnection,

    /// `Sec-WebSocket-Key` header missing or empty.
    #[error("Missing 'Sec-WebSocket-Key' header")]
    MissingSecKey,

    /// `Sec-WebSocket-Version` header not equal to 13.
    #[error("Unsupported WebSocket version (must be 13)")]
    InvalidVersion,

    /// The configured origin predicate rejected the request.
    #[error("Origin check failed")]
    OriginDenied,

    /// The peer closed the stream before a complete request or response was
    /// read.
    #[error("Incomplete handshake")]
    Incomplete,

    /// The header section looked like a flood: too many tiny packets or too
    /// many total bytes before completion.
    #[error("Handshake header flood")]
    HeaderFlood,

    /// The bytes on the stream were not parseable as an HTTP head.
    #[error("Malformed HTTP in handshake: {0}")]
    Parse(String),

    /// Dialer only: the server answered with a status other than 101.
    #[error("Unexpected handshake status: {0}")]
    BadStatus(u16),

    /// Dialer only: `Sec-WebSocket-Accept` did not match the sent key.
    #[error("Mismatched 'Sec-WebSocket-Accept' header")]
    AcceptKeyMismatch,
}

/// Size-limit violations.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CapacityError {
    /// More header lines than the parser is willing to hold.
    #[error("Too many headers received")]
    TooManyHeaders,

    /// A single frame's payload exceeded the configured maximum.
    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge {
        /// Declared payload length.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A reassembled message grew past the configured maximum.
    #[error("Message too large: {size} > {max}")]
    MessageTooLarge {
        /// Accumulated size including the rejected fragment.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_close_predicate() {
        assert!(Error::ConnectionClosed.is_clean_close());
        assert!(!Error::HubClosed.is_clean_close());
        assert!(!Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_clean_close());
    }

    #[test]
    fn temporary_predicate() {
        assert!(Error::from(io::Error::from(io::ErrorKind::WouldBlock)).is_temporary());
        assert!(Error::from(io::Error::from(io::ErrorKind::TimedOut)).is_temporary());
        assert!(!Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_temporary());
        assert!(!Error::ConnectionClosed.is_temporary());
        assert!(!Error::Protocol(ProtocolError::ReservedBits).is_temporary());
    }
}
