#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]
//! Surge: real-time messaging building blocks.
//!
//! Two independent protocols over HTTP share one broadcast pattern:
//!
//! - **WebSocket** (RFC 6455): frame codec, upgrade handshake and a
//!   full-duplex [`Connection`] that reassembles fragmented messages,
//!   answers pings and performs the close handshake. A [`Hub`] fans
//!   messages out to many connections and evicts peers whose writes fail.
//! - **Server-Sent Events**: a one-way [`sse::SseConnection`] writing
//!   `text/event-stream` records, and a typed [`sse::SseHub`] with the same
//!   fan-out and eviction behavior.
//!
//! The library's boundary is the raw byte stream. A host HTTP server routes
//! the request and hands the underlying stream to [`accept`] (WebSocket) or
//! [`sse::SseConnection::upgrade`] (SSE); TLS, authentication and request
//! routing stay with the host.

pub use http;

pub mod buffer;
pub mod error;
pub mod handshake;
pub mod hub;
pub mod protocol;
pub mod sse;

#[cfg(test)]
mod testutil;

/// Maximum payload length of a single data frame accepted or emitted by the
/// codec. Larger frames are rejected as frame-too-large.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;
/// Maximum size of a reassembled message. Fragment chains growing past this
/// are rejected as message-too-large.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
/// Maximum payload length of a control frame (RFC 6455 Section 5.5).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Default capacity of the buffered reader wrapping the inbound stream.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Default capacity of the buffered writer wrapping the outbound stream.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

pub use bytes::Bytes;

pub use crate::{
    error::{CapacityError, Error, HandshakeError, ProtocolError, Result},
    handshake::server::{accept, accept_split, accept_with_options},
    hub::Hub,
    protocol::{
        config::UpgradeOptions,
        connection::{Connection, Role},
        frame::{CloseFrame, Frame, FrameHeader},
        message::Message,
        opcode::{CloseCode, OpCode},
        utf8::Utf8Bytes,
    },
};
