//! The RFC 6455 wire unit: header layout, payload, close payload parsing
//! and frame emission.

use std::{
    io::{Cursor, ErrorKind, Read, Write},
    mem,
};

use bytes::{Bytes, BytesMut};

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    protocol::{
        mask::{apply_mask, generate},
        opcode::{CloseCode, Control, Data, OpCode},
        utf8::Utf8Bytes,
    },
    MAX_CONTROL_FRAME_PAYLOAD,
};

/// Parsed payload of a close frame: status code plus optional reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The status code.
    pub code: CloseCode,
    /// The reason text, possibly empty.
    pub reason: Utf8Bytes,
}

impl std::fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// A WebSocket frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of the message.
    pub fin: bool,
    /// Reserved for extensions; must be clear.
    pub rsv1: bool,
    /// Reserved for extensions; must be clear.
    pub rsv2: bool,
    /// Reserved for extensions; must be clear.
    pub rsv3: bool,
    /// The operation code.
    pub opcode: OpCode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Largest possible header: 2 base octets + 8 length octets + 4 key
    /// octets.
    pub(crate) const MAX_HEADER_SIZE: usize = 14;

    /// Parse a header from the cursor. Returns `Ok(None)` without consuming
    /// anything when the buffered data is not yet a complete header. The
    /// declared payload length is returned alongside.
    pub fn parse(cursor: &mut Cursor<impl AsRef<[u8]>>) -> Result<Option<(Self, u64)>> {
        let init = cursor.position();

        match Self::parse_inner(cursor) {
            incomplete @ Ok(None) => {
                cursor.set_position(init);
                incomplete
            }
            other => other,
        }
    }

    fn parse_inner(cursor: &mut impl Read) -> Result<Option<(Self, u64)>> {
        let (first, second) = {
            let mut head = [0u8; 2];
            if cursor.read(&mut head)? != 2 {
                return Ok(None);
            }
            (head[0], head[1])
        };

        let fin = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;

        let opcode = OpCode::from_u4(first & 0x0F)
            .ok_or(Error::Protocol(ProtocolError::InvalidOpcode(first & 0x0F)))?;

        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol(ProtocolError::ReservedBits));
        }

        if opcode.is_control() && !fin {
            return Err(Error::Protocol(ProtocolError::ControlFragmented));
        }

        let masked = second & 0x80 != 0;

        let length = {
            let len_byte = second & 0x7F;
            let extra = Length::for_byte(len_byte).additional();

            if extra > 0 {
                const SIZE: usize = mem::size_of::<u64>();
                let start = SIZE - extra;
                let mut buf = [0u8; SIZE];

                match cursor.read_exact(&mut buf[start..]) {
                    Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                    Ok(()) => u64::from_be_bytes(buf),
                }
            } else {
                u64::from(len_byte)
            }
        };

        if length & (1 << 63) != 0 {
            return Err(Error::Protocol(ProtocolError::InvalidLength));
        }

        if opcode.is_control() && length > MAX_CONTROL_FRAME_PAYLOAD as u64 {
            return Err(Error::Protocol(ProtocolError::ControlTooLarge));
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            if cursor.read(&mut key)? != 4 {
                return Ok(None);
            }
            Some(key)
        } else {
            None
        };

        Ok(Some((FrameHeader { fin, rsv1, rsv2, rsv3, opcode, mask }, length)))
    }

    /// Size of this header once formatted for the given payload length.
    pub fn len(&self, length: u64) -> usize {
        2 + Length::for_len(length).additional() + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Write the header for a payload of the given length, choosing the
    /// minimal length encoding.
    pub fn format(&self, length: u64, output: &mut impl Write) -> Result<()> {
        let code: u8 = self.opcode.into();

        let first_byte = code
            | if self.fin { 0x80 } else { 0 }
            | if self.rsv1 { 0x40 } else { 0 }
            | if self.rsv2 { 0x20 } else { 0 }
            | if self.rsv3 { 0x10 } else { 0 };

        let len = Length::for_len(length);
        let second_byte = len.len_byte() | if self.mask.is_some() { 0x80 } else { 0 };

        output.write_all(&[first_byte, second_byte])?;

        match len {
            Length::U8(_) => (),
            Length::U16 => output.write_all(&(length as u16).to_be_bytes())?,
            Length::U64 => output.write_all(&length.to_be_bytes())?,
        }

        if let Some(ref mask) = self.mask {
            output.write_all(mask)?;
        }

        Ok(())
    }

    /// Store a fresh random masking key in the header. Payload bytes are
    /// untouched; the key is applied at format time.
    pub(crate) fn set_random_mask(&mut self) {
        self.mask = Some(generate());
    }
}

/// A complete WebSocket frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Assemble a frame from parsed parts.
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }

    /// Create a data frame.
    pub fn data(opcode: Data, payload: impl Into<Bytes>, fin: bool) -> Frame {
        Frame {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Data(opcode),
                mask: None,
            },
            payload: payload.into(),
        }
    }

    /// Create a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Frame {
        Frame::control(Control::Ping, payload.into())
    }

    /// Create a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Frame {
        Frame::control(Control::Pong, payload.into())
    }

    /// Create a close frame. `None` produces an empty payload carrying no
    /// status code.
    pub fn close(frame: Option<CloseFrame>) -> Frame {
        let payload = if let Some(CloseFrame { code, reason }) = frame {
            let mut buf = BytesMut::with_capacity(2 + reason.len());
            buf.extend_from_slice(&u16::from(code).to_be_bytes());
            buf.extend_from_slice(reason.as_bytes());
            buf.freeze()
        } else {
            Bytes::new()
        };

        Frame::control(Control::Close, payload)
    }

    fn control(opcode: Control, payload: Bytes) -> Frame {
        Frame {
            header: FrameHeader {
                fin: true,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Control(opcode),
                mask: None,
            },
            payload,
        }
    }

    /// Total size on the wire: header plus payload.
    pub fn len(&self) -> usize {
        let length = self.payload.len();
        self.header.len(length as u64) + length
    }

    /// Whether the frame occupies zero bytes (never true: the header alone
    /// is two bytes).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The frame's header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Mutable access to the frame's header.
    pub fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    /// The frame's payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, keeping the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Parse the payload as the body of a close frame.
    ///
    /// An empty payload means the peer sent no status code. A single-byte
    /// payload cannot hold one and is a protocol violation. The reason text
    /// must be UTF-8.
    pub fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseFrame)),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]).into();
                let reason = Utf8Bytes::try_from(self.payload.slice(2..))?;
                Ok(Some(CloseFrame { code, reason }))
            }
        }
    }

    /// Check the invariants the emit path enforces: control frames are
    /// final and short, complete text frames hold UTF-8, the payload fits
    /// the configured limit.
    pub fn validate(&self, max_payload: usize) -> Result<()> {
        if self.header.opcode.is_control() {
            if !self.header.fin {
                return Err(Error::Protocol(ProtocolError::ControlFragmented));
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::Protocol(ProtocolError::ControlTooLarge));
            }
        }

        if self.header.opcode == OpCode::Data(Data::Text) && self.header.fin {
            std::str::from_utf8(&self.payload)?;
        }

        if self.payload.len() > max_payload {
            return Err(Error::Capacity(CapacityError::FrameTooLarge {
                size: self.payload.len(),
                max: max_payload,
            }));
        }

        Ok(())
    }

    /// Validate, then write the frame. Masked payloads are XORed on a
    /// defensive copy so the caller's buffer is never mutated. Does not
    /// flush.
    pub fn format_to(&self, output: &mut impl Write, max_payload: usize) -> Result<()> {
        self.validate(max_payload)?;
        self.format_unchecked(output)
    }

    /// Emit without validation. Negative tests use this to put malformed
    /// frames on the wire; production paths go through [`Frame::format_to`].
    pub(crate) fn format_unchecked(&self, output: &mut impl Write) -> Result<()> {
        self.header.format(self.payload.len() as u64, output)?;

        if let Some(mask) = self.header.mask {
            let mut masked = self.payload.to_vec();
            apply_mask(&mut masked, mask);
            output.write_all(&masked)?;
        } else {
            output.write_all(&self.payload)?;
        }

        Ok(())
    }
}

enum Length {
    U8(u8),
    U16,
    U64,
}

impl Length {
    #[inline]
    fn for_len(len: u64) -> Self {
        if len < 126 {
            Length::U8(len as u8)
        } else if len < 65536 {
            Length::U16
        } else {
            Length::U64
        }
    }

    #[inline]
    fn additional(&self) -> usize {
        match *self {
            Self::U8(_) => 0,
            Self::U16 => 2,
            Self::U64 => 8,
        }
    }

    #[inline]
    fn len_byte(&self) -> u8 {
        match *self {
            Self::U8(b) => b,
            Self::U16 => 126,
            Self::U64 => 127,
        }
    }

    #[inline]
    fn for_byte(byte: u8) -> Self {
        match byte & 0x7F {
            126 => Length::U16,
            127 => Length::U64,
            b => Length::U8(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_PAYLOAD;

    fn parse_all(bytes: &[u8]) -> Result<Option<(FrameHeader, u64)>> {
        FrameHeader::parse(&mut Cursor::new(bytes))
    }

    #[test]
    fn header_round_trip_at_length_boundaries() {
        for len in [0u64, 125, 126, 1000, 65535, 65536] {
            let header = FrameHeader {
                fin: true,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Data(Data::Binary),
                mask: None,
            };

            let mut wire = Vec::new();
            header.format(len, &mut wire).unwrap();
            assert_eq!(wire.len(), header.len(len));

            let (parsed, parsed_len) = parse_all(&wire).unwrap().unwrap();
            assert_eq!(parsed, header);
            assert_eq!(parsed_len, len);
        }
    }

    #[test]
    fn minimal_length_encoding_chosen() {
        let header = FrameHeader {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Data(Data::Binary),
            mask: None,
        };

        for (len, expected_header_len) in
            [(0u64, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)]
        {
            let mut wire = Vec::new();
            header.format(len, &mut wire).unwrap();
            assert_eq!(wire.len(), expected_header_len, "payload length {len}");
        }
    }

    #[test]
    fn partial_header_rolls_back_cursor() {
        // Declares a 16-bit length but provides only one of its two octets.
        let mut cursor = Cursor::new(vec![0x82u8, 126, 0x01]);
        assert!(FrameHeader::parse(&mut cursor).unwrap().is_none());
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn reserved_bits_rejected() {
        for first in [0xC2u8, 0xA2, 0x92] {
            let err = parse_all(&[first, 0x00]).unwrap_err();
            assert!(matches!(err, Error::Protocol(ProtocolError::ReservedBits)));
        }
    }

    #[test]
    fn invalid_opcode_rejected() {
        let err = parse_all(&[0x83, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidOpcode(0x3))));
    }

    #[test]
    fn fragmented_control_rejected() {
        // Ping with FIN clear.
        let err = parse_all(&[0x09, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ControlFragmented)));
    }

    #[test]
    fn oversized_control_rejected() {
        let err = parse_all(&[0x89, 126, 0x00, 126]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ControlTooLarge)));
    }

    #[test]
    fn sixty_four_bit_length_with_high_bit_rejected() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 63 | 16).to_be_bytes());
        let err = parse_all(&wire).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidLength)));
    }

    #[test]
    fn close_payload_parsing() {
        let empty = Frame::control(Control::Close, Bytes::new());
        assert!(empty.into_close().unwrap().is_none());

        let short = Frame::control(Control::Close, Bytes::from_static(&[0x03]));
        assert!(matches!(
            short.into_close().unwrap_err(),
            Error::Protocol(ProtocolError::InvalidCloseFrame)
        ));

        let mut payload = vec![0x03, 0xE8];
        payload.extend_from_slice(b"done");
        let full = Frame::control(Control::Close, Bytes::from(payload));
        let parsed = full.into_close().unwrap().unwrap();
        assert_eq!(parsed.code, CloseCode::Normal);
        assert_eq!(parsed.reason, "done");
    }

    #[test]
    fn close_reason_must_be_utf8() {
        let frame = Frame::control(Control::Close, Bytes::from_static(&[0x03, 0xE8, 0xFF, 0xFE]));
        assert!(matches!(frame.into_close().unwrap_err(), Error::Utf8(_)));
    }

    #[test]
    fn emit_validates_control_payload() {
        let oversized = Frame::ping(vec![0u8; 126]);
        let err = oversized.format_to(&mut Vec::new(), MAX_FRAME_PAYLOAD).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ControlTooLarge)));
    }

    #[test]
    fn emit_validates_text_utf8() {
        let frame = Frame::data(Data::Text, Bytes::from_static(&[0xFF, 0xFE]), true);
        let err = frame.format_to(&mut Vec::new(), MAX_FRAME_PAYLOAD).unwrap_err();
        assert!(matches!(err, Error::Utf8(_)));
    }

    #[test]
    fn masked_emission_copies_payload() {
        let payload = Bytes::from_static(b"Hello");
        let mut frame = Frame::data(Data::Text, payload.clone(), true);
        frame.header_mut().mask = Some([0x12, 0x34, 0x56, 0x78]);

        let mut wire = Vec::new();
        frame.format_to(&mut wire, MAX_FRAME_PAYLOAD).unwrap();

        // The caller's payload is untouched.
        assert_eq!(frame.payload(), payload.as_ref());
        // Wire: 2 header octets + 4 key octets + 5 masked payload octets.
        assert_eq!(wire.len(), 11);
        let mut body = wire[6..].to_vec();
        apply_mask(&mut body, [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(body, b"Hello");
    }
}
