//! Raw-wire helpers shared by the integration suites: a byte-level
//! WebSocket client good enough to poke at a server without going through
//! the library under test.

#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

/// Key and accept value from RFC 6455 Section 1.3.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

pub fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Send a standard upgrade request with the RFC sample key and consume the
/// server's response head, returning it for inspection.
pub fn raw_handshake(stream: &mut TcpStream) -> String {
    let request = format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).unwrap();

    read_response_head(stream)
}

/// Read bytes until the blank line ending an HTTP head.
pub fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Write one masked client frame. `first_byte` carries FIN/RSV/opcode,
/// e.g. 0x81 for a final text frame.
pub fn write_masked_frame(stream: &mut TcpStream, first_byte: u8, payload: &[u8], mask: [u8; 4]) {
    let mut wire = vec![first_byte];

    match payload.len() {
        len @ 0..=125 => wire.push(0x80 | len as u8),
        len @ 126..=65535 => {
            wire.push(0x80 | 126);
            wire.extend((len as u16).to_be_bytes());
        }
        len => {
            wire.push(0x80 | 127);
            wire.extend((len as u64).to_be_bytes());
        }
    }

    wire.extend(mask);
    let start = wire.len();
    wire.extend(payload);
    for (i, byte) in wire[start..].iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    stream.write_all(&wire).unwrap();
}

/// Read one unmasked server frame, returning its first header byte and
/// payload.
pub fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[1] & 0x80, 0, "server frames must not be masked");

    let length = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        short => short as usize,
    };

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).unwrap();
    (head[0], payload)
}
