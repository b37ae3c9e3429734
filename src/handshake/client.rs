//! Minimal outbound dialer used by the integration tests.
//!
//! Opens a TCP stream, performs the client side of the upgrade and wraps
//! the socket in a client-role [`Connection`]. Deliberately small: no TLS
//! (`wss://` is the host runtime's concern), no redirects, no extension
//! negotiation. Not part of the supported API surface.

use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use base64::Engine;
use bytes::Buf;
use httparse::EMPTY_HEADER;

use crate::{
    buffer::ReadBuffer,
    error::{Error, HandshakeError, Result},
    handshake::{derive_accept_key, header_contains_token, server::MAX_HEADERS},
    protocol::{
        config::UpgradeOptions,
        connection::{Connection, Role},
    },
};

/// Generate a `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Dial a WebSocket server with default options.
///
/// `host` goes into the `Host` header verbatim; `path` is the request
/// target, e.g. `/chat`.
pub fn connect(addr: impl ToSocketAddrs, host: &str, path: &str) -> Result<Connection> {
    connect_with_options(addr, host, path, UpgradeOptions::default())
}

/// [`connect`] with explicit options; `options.subprotocols` is offered to
/// the server.
pub fn connect_with_options(
    addr: impl ToSocketAddrs,
    host: &str,
    path: &str,
    options: UpgradeOptions,
) -> Result<Connection> {
    let stream = TcpStream::connect(addr)?;
    let mut write_half = stream.try_clone()?;
    let mut read_half = stream.try_clone()?;

    let key = generate_key();
    write_request(&mut write_half, host, path, &key, &options.subprotocols)?;

    let tail = read_and_verify_response(&mut read_half, &key)?;

    Connection::from_tcp_parts(stream, tail, Role::Client, &options)
}

fn write_request(
    stream: &mut impl Write,
    host: &str,
    path: &str,
    key: &str,
    subprotocols: &[String],
) -> Result<()> {
    let protocol_header = if subprotocols.is_empty() {
        String::new()
    } else {
        format!("Sec-WebSocket-Protocol: {}\r\n", subprotocols.join(", "))
    };

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {protocol_header}\
         \r\n"
    );

    stream.write_all(request.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Read the server's response head, require 101 with a matching accept
/// key, and return any bytes that followed it.
fn read_and_verify_response(stream: &mut impl Read, key: &str) -> Result<Vec<u8>> {
    let mut buffer: ReadBuffer<4096> = ReadBuffer::new();

    loop {
        let count = buffer.read_from(stream)?;
        if count == 0 {
            return Err(Error::Handshake(HandshakeError::Incomplete));
        }

        let mut header_buffer = [EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut header_buffer);

        match response.parse(Buf::chunk(&buffer))? {
            httparse::Status::Partial => continue,
            httparse::Status::Complete(size) => {
                verify_response(&response, key)?;
                buffer.advance(size);
                return Ok(buffer.into_vec());
            }
        }
    }
}

fn verify_response(response: &httparse::Response<'_, '_>, key: &str) -> Result<()> {
    let status = response.code.unwrap_or(0);
    if status != 101 {
        return Err(Error::Handshake(HandshakeError::BadStatus(status)));
    }

    let header = |name: &str| {
        response
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .and_then(|header| std::str::from_utf8(header.value).ok())
            .unwrap_or("")
    };

    if !header_contains_token(header("Upgrade"), "websocket") {
        return Err(Error::Handshake(HandshakeError::MissingUpgrade));
    }

    if header("Sec-WebSocket-Accept") != derive_accept_key(key.as_bytes()) {
        return Err(Error::Handshake(HandshakeError::AcceptKeyMismatch));
    }

    Ok(())
}
