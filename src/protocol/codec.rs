//! Buffered frame reader: turns a byte stream into validated frames.

use std::io::{self, Cursor, Read};

use bytes::{Buf, BytesMut};

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    protocol::{
        frame::{Frame, FrameHeader},
        mask::apply_mask,
        opcode::{Data, OpCode},
    },
};

/// What to do about the mask bit on inbound frames (RFC 6455 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskingPolicy {
    /// Server side: every client frame must be masked.
    Required,
    /// Client side: no server frame may be masked.
    Rejected,
}

/// Reads frames out of an internal buffer that is refilled from the stream
/// on demand. Unmasks payloads and validates UTF-8 for complete text
/// frames.
#[derive(Debug)]
pub struct FrameCodec {
    /// Bytes read from the stream but not yet consumed.
    in_buffer: BytesMut,
    /// Upper bound on a single refill read.
    chunk_size: usize,
    /// Upper bound on a single frame's payload.
    max_frame_size: usize,
    /// Header of the frame currently being received, with its declared
    /// payload length.
    header: Option<(FrameHeader, u64)>,
}

impl FrameCodec {
    /// Create a codec with an empty buffer.
    pub fn new(read_buffer_size: usize, max_frame_size: usize) -> Self {
        Self::from_partially_read(Vec::new(), read_buffer_size, max_frame_size)
    }

    /// Create a codec whose buffer starts with bytes that were read past
    /// the end of the handshake.
    pub fn from_partially_read(tail: Vec<u8>, read_buffer_size: usize, max_frame_size: usize) -> Self {
        let mut in_buffer = BytesMut::from_iter(tail);
        in_buffer.reserve(read_buffer_size.saturating_sub(in_buffer.len()));

        FrameCodec {
            in_buffer,
            chunk_size: read_buffer_size.max(FrameHeader::MAX_HEADER_SIZE),
            max_frame_size,
            header: None,
        }
    }

    /// Read exactly one frame, blocking on the stream as needed.
    ///
    /// The payload is unmasked before being returned and the masking policy
    /// is enforced. A stream that ends mid-frame or between frames reports
    /// `UnexpectedEof`.
    pub fn read_frame<S: Read>(&mut self, stream: &mut S, policy: MaskingPolicy) -> Result<Frame> {
        let mut payload = loop {
            if self.header.is_none() {
                let mut cursor = Cursor::new(&mut self.in_buffer);
                self.header = FrameHeader::parse(&mut cursor)?;
                let consumed = cursor.position();
                Buf::advance(&mut self.in_buffer, consumed as usize);

                if let Some((_, length)) = &self.header {
                    let length = *length as usize;

                    if length > self.max_frame_size {
                        return Err(Error::Capacity(CapacityError::FrameTooLarge {
                            size: length,
                            max: self.max_frame_size,
                        }));
                    }

                    self.in_buffer.reserve(length);
                } else {
                    self.in_buffer.reserve(FrameHeader::MAX_HEADER_SIZE);
                }
            }

            if let Some((_, length)) = &self.header {
                let length = *length as usize;
                if length <= self.in_buffer.len() {
                    break self.in_buffer.split_to(length);
                }
            }

            if self.read_in(stream)? == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed while reading frame",
                )));
            }
        };

        let (mut header, length) = self.header.take().expect("frame header must be set");
        debug_assert_eq!(payload.len() as u64, length);

        match (header.mask.take(), policy) {
            (Some(mask), MaskingPolicy::Required) => apply_mask(&mut payload, mask),
            (None, MaskingPolicy::Required) => {
                return Err(Error::Protocol(ProtocolError::MaskRequired));
            }
            (Some(_), MaskingPolicy::Rejected) => {
                return Err(Error::Protocol(ProtocolError::MaskUnexpected));
            }
            (None, MaskingPolicy::Rejected) => (),
        }

        // Complete text frames are validated here; fragmented text is
        // validated across fragment boundaries during reassembly.
        if header.opcode == OpCode::Data(Data::Text) && header.fin {
            std::str::from_utf8(&payload)?;
        }

        Ok(Frame::new(header, payload.freeze()))
    }

    /// Refill the buffer with up to one chunk from the stream.
    fn read_in<S: Read>(&mut self, stream: &mut S) -> io::Result<usize> {
        let len = self.in_buffer.len();
        self.in_buffer.resize(len + self.chunk_size, 0);

        let size = stream.read(&mut self.in_buffer[len..]);
        self.in_buffer.truncate(len + size.as_ref().copied().unwrap_or(0));

        size
    }
}
