//! Server side of the upgrade: request validation, subprotocol
//! negotiation and the 101 response.

use std::{
    io::{Read, Write},
    net::TcpStream,
};

use bytes::Buf;
use http::{header::HeaderName, HeaderValue, Method, Request, Version};
use httparse::EMPTY_HEADER;

use crate::{
    buffer::ReadBuffer,
    error::{Error, HandshakeError, Result},
    handshake::{derive_accept_key, header_contains_token},
    protocol::{
        config::UpgradeOptions,
        connection::{Connection, Role},
    },
};

/// Limit on the number of header lines in the upgrade request.
pub const MAX_HEADERS: usize = 124;

/// Accept a WebSocket connection on the stream with default options.
///
/// Reads and validates the client's upgrade request, writes the 101
/// response and returns the server-role connection together with the
/// negotiated subprotocol, if any.
pub fn accept(stream: TcpStream) -> Result<(Connection, Option<String>)> {
    accept_with_options(stream, UpgradeOptions::default())
}

/// [`accept`] with explicit options: subprotocols, origin check and
/// buffer/limit sizes.
pub fn accept_with_options(
    stream: TcpStream,
    options: UpgradeOptions,
) -> Result<(Connection, Option<String>)> {
    let mut read_half = stream.try_clone()?;
    let mut write_half = stream.try_clone()?;

    let (request, tail) = read_request(&mut read_half)?;
    let (accept_key, protocol) = validate_request(&request, &options)?;
    write_response(&mut write_half, &accept_key, protocol.as_deref())?;

    let connection = Connection::from_tcp_parts(stream, tail, Role::Server, &options)?;
    Ok((connection, protocol))
}

/// Accept over separate reader and writer halves, for streams that are not
/// plain TCP sockets. The returned connection owns both halves; closing it
/// cannot shut an underlying socket down, so the caller keeps that
/// responsibility.
pub fn accept_split<R, W>(
    mut reader: R,
    mut writer: W,
    options: UpgradeOptions,
) -> Result<(Connection, Option<String>)>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (request, tail) = read_request(&mut reader)?;
    let (accept_key, protocol) = validate_request(&request, &options)?;
    write_response(&mut writer, &accept_key, protocol.as_deref())?;

    let connection = Connection::upgraded(reader, writer, tail, Role::Server, &options, None);
    Ok((connection, protocol))
}

/// Accumulate bytes until a complete request head is parsed. Whatever
/// follows the head is returned as the tail for the frame codec.
fn read_request(stream: &mut impl Read) -> Result<(Request<()>, Vec<u8>)> {
    let mut buffer: ReadBuffer<4096> = ReadBuffer::new();
    let mut attack_check = AttackCheck::new();

    loop {
        let count = buffer.read_from(stream)?;
        if count == 0 {
            return Err(Error::Handshake(HandshakeError::Incomplete));
        }
        attack_check.check_incoming_packet(count)?;

        if let Some((size, request)) = parse_request(Buf::chunk(&buffer))? {
            buffer.advance(size);
            return Ok((request, buffer.into_vec()));
        }
    }
}

/// Try to parse a request head from the accumulated bytes. `None` means
/// more data is needed.
fn parse_request(data: &[u8]) -> Result<Option<(usize, Request<()>)>> {
    let mut header_buffer = [EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut header_buffer);

    match raw.parse(data)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(size) => {
            if raw.version != Some(1) {
                return Err(Error::Handshake(HandshakeError::InvalidHttpVersion));
            }

            let mut request = Request::new(());
            *request.method_mut() = Method::from_bytes(raw.method.unwrap_or("").as_bytes())
                .map_err(http::Error::from)?;
            *request.uri_mut() =
                raw.path.unwrap_or("/").parse().map_err(http::Error::from)?;
            *request.version_mut() = Version::HTTP_11;

            let headers = request.headers_mut();
            for header in raw.headers.iter() {
                headers.append(
                    HeaderName::from_bytes(header.name.as_bytes()).map_err(http::Error::from)?,
                    HeaderValue::from_bytes(header.value).map_err(http::Error::from)?,
                );
            }

            Ok(Some((size, request)))
        }
    }
}

/// Validate the upgrade request per RFC 6455 Section 4.2.1 and negotiate a
/// subprotocol. Returns the accept key to answer with.
fn validate_request(
    request: &Request<()>,
    options: &UpgradeOptions,
) -> Result<(String, Option<String>)> {
    if request.method() != Method::GET {
        return Err(Error::Handshake(HandshakeError::InvalidMethod));
    }

    let header_str = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    };

    if !header_contains_token(header_str("Upgrade"), "websocket") {
        return Err(Error::Handshake(HandshakeError::MissingUpgrade));
    }

    if !header_contains_token(header_str("Connection"), "upgrade") {
        return Err(Error::Handshake(HandshakeError::MissingConnection));
    }

    if header_str("Sec-WebSocket-Version") != "13" {
        return Err(Error::Handshake(HandshakeError::InvalidVersion));
    }

    let key = header_str("Sec-WebSocket-Key");
    if key.is_empty() {
        return Err(Error::Handshake(HandshakeError::MissingSecKey));
    }

    if let Some(check_origin) = &options.check_origin {
        if !check_origin(request) {
            return Err(Error::Handshake(HandshakeError::OriginDenied));
        }
    }

    let protocol = negotiate_subprotocol(request, &options.subprotocols);

    Ok((derive_accept_key(key.as_bytes()), protocol))
}

/// Pick the first client-offered protocol that the server also speaks.
/// No overlap (or an empty server list) selects nothing, which is not an
/// error.
fn negotiate_subprotocol(request: &Request<()>, server_protocols: &[String]) -> Option<String> {
    if server_protocols.is_empty() {
        return None;
    }

    request
        .headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find(|offered| server_protocols.iter().any(|server| server == offered))
        .map(str::to_owned)
}

fn write_response(stream: &mut impl Write, accept_key: &str, protocol: Option<&str>) -> Result<()> {
    let protocol_header = match protocol {
        Some(protocol) => format!("Sec-WebSocket-Protocol: {protocol}\r\n"),
        None => String::new(),
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         {protocol_header}\
         \r\n"
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Flood mitigation while reading the request head: reject inputs that
/// keep trickling tiny packets or grow past any sane header size.
#[derive(Debug)]
struct AttackCheck {
    /// Number of successful reads so far.
    packets: usize,
    /// Total bytes accumulated so far.
    bytes: usize,
}

impl AttackCheck {
    fn new() -> Self {
        Self { packets: 0, bytes: 0 }
    }

    fn check_incoming_packet(&mut self, size: usize) -> Result<()> {
        self.packets += 1;
        self.bytes += size;

        const MAX_BYTES: usize = 65536;
        const MAX_PACKETS: usize = 512;
        const MIN_PACKET_SIZE: usize = 128;
        const MIN_PACKET_CHECK_THRESHOLD: usize = 64;

        if self.bytes > MAX_BYTES
            || self.packets > MAX_PACKETS
            || (self.packets > MIN_PACKET_CHECK_THRESHOLD
                && self.packets * MIN_PACKET_SIZE > self.bytes)
        {
            return Err(Error::Handshake(HandshakeError::HeaderFlood));
        }

        Ok(())
    }
}
