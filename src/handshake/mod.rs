//! The HTTP upgrade that promotes a request to a WebSocket byte stream.

#[doc(hidden)]
pub mod client;
pub mod server;

use base64::Engine;
use sha1::{Digest, Sha1};

/// Fixed GUID from RFC 6455 Section 1.3.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the `Sec-WebSocket-Accept` value from a `Sec-WebSocket-Key`:
/// base64 of the SHA-1 of the key concatenated with the RFC 6455 GUID.
pub fn derive_accept_key(request_key: &[u8]) -> String {
    let mut hasher = Sha1::default();
    <Sha1 as Digest>::update(&mut hasher, request_key);
    <Sha1 as Digest>::update(&mut hasher, WS_GUID);

    base64::engine::general_purpose::STANDARD.encode(<Sha1 as Digest>::finalize(hasher))
}

/// Whether a comma-separated header value contains the token,
/// case-insensitively. `Upgrade: keep-alive, Upgrade` style lists are
/// common on the Connection header.
pub(crate) fn header_contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}
