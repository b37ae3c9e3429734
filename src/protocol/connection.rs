//! The WebSocket session: message reads with fragment reassembly and
//! interleaved control handling, serialized writes, and the idempotent
//! close handshake.

use std::{
    io::{self, BufWriter, Read, Write},
    net::{Shutdown, TcpStream},
};

use bytes::Bytes;
use parking_lot::{Mutex, Once, RwLock};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::{Error, ProtocolError, Result},
    protocol::{
        codec::{FrameCodec, MaskingPolicy},
        config::UpgradeOptions,
        frame::{CloseFrame, Frame},
        message::{IncompleteMessage, IncompleteMessageType, Message},
        opcode::{CloseCode, Control, Data, OpCode},
        utf8::Utf8Bytes,
    },
    MAX_CONTROL_FRAME_PAYLOAD,
};

type BoxRead = Box<dyn Read + Send>;
type BoxWrite = Box<dyn Write + Send>;
type ShutdownHook = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Which end of the session this connection is, deciding the masking rules
/// on both directions (RFC 6455 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by an upgrade: emits unmasked, requires inbound masking.
    Server,
    /// Produced by a dialer: masks everything it emits, rejects masked
    /// inbound frames.
    Client,
}

impl Role {
    fn masking_policy(self) -> MaskingPolicy {
        match self {
            Role::Server => MaskingPolicy::Required,
            Role::Client => MaskingPolicy::Rejected,
        }
    }

    fn masks_output(self) -> bool {
        matches!(self, Role::Client)
    }
}

struct ReadHalf {
    stream: BoxRead,
    codec: FrameCodec,
    /// Reassembly state of the fragmented message in progress, if any.
    fragment: Option<IncompleteMessage>,
}

struct WriteHalf {
    stream: BufWriter<BoxWrite>,
}

/// An open WebSocket session over a hijacked byte stream.
///
/// All methods take `&self`: reads are serialized by the reader lock,
/// frame emissions by the writer lock, so a `Connection` can be shared
/// across threads (typically inside an `Arc` handed to a hub).
pub struct Connection {
    role: Role,
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
    closed: RwLock<bool>,
    close_latch: Once,
    shutdown: Option<ShutdownHook>,
    max_frame_size: usize,
    max_message_size: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap a pair of stream halves that already completed the handshake.
    pub fn new<R, W>(reader: R, writer: W, role: Role, options: &UpgradeOptions) -> Connection
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Connection::upgraded(reader, writer, Vec::new(), role, options, None)
    }

    /// Wrap a `TcpStream`, splitting it into its two halves. Closing the
    /// connection shuts the socket down, which unblocks a reader parked in
    /// a syscall.
    pub fn from_tcp(stream: TcpStream, role: Role, options: &UpgradeOptions) -> Result<Connection> {
        Connection::from_tcp_parts(stream, Vec::new(), role, options)
    }

    pub(crate) fn from_tcp_parts(
        stream: TcpStream,
        tail: Vec<u8>,
        role: Role,
        options: &UpgradeOptions,
    ) -> Result<Connection> {
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        let shutdown: ShutdownHook = Box::new(move || match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        });

        Ok(Connection::upgraded(read_half, write_half, tail, role, options, Some(shutdown)))
    }

    pub(crate) fn upgraded<R, W>(
        reader: R,
        writer: W,
        tail: Vec<u8>,
        role: Role,
        options: &UpgradeOptions,
        shutdown: Option<ShutdownHook>,
    ) -> Connection
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Connection {
            role,
            reader: Mutex::new(ReadHalf {
                stream: Box::new(reader),
                codec: FrameCodec::from_partially_read(
                    tail,
                    options.read_buffer_size,
                    options.max_frame_size,
                ),
                fragment: None,
            }),
            writer: Mutex::new(WriteHalf {
                stream: BufWriter::with_capacity(options.write_buffer_size, Box::new(writer)),
            }),
            closed: RwLock::new(false),
            close_latch: Once::new(),
            shutdown,
            max_frame_size: options.max_frame_size,
            max_message_size: options.max_message_size,
        }
    }

    /// Which end of the session this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the close latch is set.
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Read the next complete message.
    ///
    /// Control frames encountered along the way are handled inline: pings
    /// are answered, pongs ignored, and a close frame latches the
    /// connection, echoes the peer's status code and surfaces
    /// [`Error::ConnectionClosed`]. Fragmented messages are reassembled and
    /// UTF-8 validated as a whole before being returned.
    pub fn read(&self) -> Result<Message> {
        let mut reader = self.reader.lock();

        loop {
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }

            let ReadHalf { stream, codec, fragment } = &mut *reader;
            let frame = match codec.read_frame(stream, self.role.masking_policy()) {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail_read(err)),
            };

            match frame.header().opcode {
                OpCode::Control(Control::Ping) => {
                    self.send_frame(Frame::pong(frame.into_payload()))?;
                }
                OpCode::Control(Control::Pong) => (),
                OpCode::Control(Control::Close) => {
                    return Err(self.handle_close_frame(frame));
                }
                OpCode::Data(opcode @ (Data::Text | Data::Binary)) => {
                    if fragment.is_some() {
                        return Err(
                            self.fail_read(Error::Protocol(ProtocolError::ExpectedContinuation))
                        );
                    }

                    let is_text = opcode == Data::Text;

                    if frame.header().fin {
                        let payload = frame.into_payload();
                        return Ok(if is_text {
                            // The codec validated complete text frames.
                            Message::Text(Utf8Bytes::try_from(payload)?)
                        } else {
                            Message::Binary(payload)
                        });
                    }

                    let mut incomplete = IncompleteMessage::new(if is_text {
                        IncompleteMessageType::Text
                    } else {
                        IncompleteMessageType::Binary
                    });
                    match incomplete.extend(frame.payload(), self.max_message_size) {
                        Ok(()) => *fragment = Some(incomplete),
                        Err(err) => return Err(self.fail_read(err)),
                    }
                }
                OpCode::Data(Data::Continuation) => {
                    let Some(mut incomplete) = fragment.take() else {
                        return Err(
                            self.fail_read(Error::Protocol(ProtocolError::UnexpectedContinuation))
                        );
                    };

                    if let Err(err) = incomplete.extend(frame.payload(), self.max_message_size) {
                        return Err(self.fail_read(err));
                    }

                    if frame.header().fin {
                        match incomplete.complete() {
                            Ok(message) => return Ok(message),
                            Err(err) => return Err(self.fail_read(err)),
                        }
                    }

                    *fragment = Some(incomplete);
                }
            }
        }
    }

    /// Read the next message, requiring it to be text.
    pub fn read_text(&self) -> Result<Utf8Bytes> {
        match self.read()? {
            Message::Text(text) => Ok(text),
            Message::Binary(_) => Err(Error::InvalidMessageType),
        }
    }

    /// Read the next message as JSON, requiring it to be text.
    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T> {
        let text = self.read_text()?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write one message as a single frame, masked when this is the client
    /// side.
    pub fn write(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let frame = match message {
            Message::Text(text) => Frame::data(Data::Text, Bytes::from(text), true),
            Message::Binary(bytes) => Frame::data(Data::Binary, bytes, true),
        };

        self.send_frame(frame)
    }

    /// Write a text message.
    pub fn write_text(&self, text: impl Into<Utf8Bytes>) -> Result<()> {
        self.write(Message::Text(text.into()))
    }

    /// Write a binary message.
    pub fn write_binary(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.write(Message::Binary(bytes.into()))
    }

    /// Serialize a value to JSON and write it as a text message.
    pub fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.write_text(serde_json::to_string(value)?)
    }

    /// Send a ping carrying up to 125 bytes of application data.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.control(Frame::ping(payload.into()))
    }

    /// Send an unsolicited pong. Pings observed by [`Connection::read`] are
    /// answered automatically.
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.control(Frame::pong(payload.into()))
    }

    fn control(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if frame.payload().len() > MAX_CONTROL_FRAME_PAYLOAD {
            return Err(Error::Protocol(ProtocolError::ControlTooLarge));
        }
        self.send_frame(frame)
    }

    /// Close with status 1000 (normal closure).
    ///
    /// Idempotent: the first call emits one close frame and shuts the
    /// stream down, every later call is a successful no-op.
    pub fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal, "")
    }

    /// Close with a specific status code and reason.
    ///
    /// Codes that must not appear on the wire (1005, 1006, 1015) produce a
    /// close frame with an empty payload.
    pub fn close_with(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.begin_close(Some(CloseFrame { code, reason: reason.into() }))
    }

    /// Emit a frame under the writer lock and flush. Every emission path
    /// funnels through here.
    fn send_frame(&self, mut frame: Frame) -> Result<()> {
        if self.role.masks_output() {
            frame.header_mut().set_random_mask();
        }

        let mut writer = self.writer.lock();
        frame.format_to(&mut writer.stream, self.max_frame_size)?;
        writer.stream.flush()?;
        Ok(())
    }

    /// One-shot close: latch, emit at most one close frame, shut the stream
    /// down. The first caller gets the emission result, later callers Ok.
    fn begin_close(&self, frame: Option<CloseFrame>) -> Result<()> {
        let mut result = Ok(());

        self.close_latch.call_once(|| {
            *self.closed.write() = true;

            let frame = frame.filter(|close| close.code.is_sendable());
            let sent = self.send_frame(Frame::close(frame));

            let shut = match &self.shutdown {
                Some(hook) => hook().map_err(Error::from),
                None => Ok(()),
            };

            result = sent.and(shut);
        });

        result
    }

    /// A close frame arrived: latch, echo the peer's code (empty payload
    /// when none was sent), report the session closed.
    fn handle_close_frame(&self, frame: Frame) -> Error {
        match frame.into_close() {
            Ok(close) => {
                let echo = close.map(|received| CloseFrame {
                    code: received.code,
                    reason: Utf8Bytes::default(),
                });
                let _ = self.begin_close(echo);
                Error::ConnectionClosed
            }
            Err(err) => self.fail_read(err),
        }
    }

    /// Map a read failure to its close code, emit a best-effort close frame
    /// and latch. I/O errors emit nothing; an I/O error on a connection
    /// that is already latched closed is reported as such.
    fn fail_read(&self, err: Error) -> Error {
        let code = match &err {
            Error::Utf8(_) => Some(CloseCode::Invalid),
            Error::Protocol(_) => Some(CloseCode::Protocol),
            Error::Capacity(_) => Some(CloseCode::Size),
            Error::Io(_) if self.is_closed() => return Error::ConnectionClosed,
            _ => None,
        };

        if let Some(code) = code {
            let _ = self.begin_close(Some(CloseFrame { code, reason: Utf8Bytes::default() }));
        }

        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::CapacityError,
        protocol::mask::apply_mask,
        testutil::SharedBuf,
    };
    use std::io::Cursor;

    /// Serialize frames the way a masking client would put them on the wire.
    fn client_frame(opcode: Data, payload: &[u8], fin: bool, mask: [u8; 4]) -> Vec<u8> {
        let mut frame = Frame::data(opcode, payload.to_vec(), fin);
        frame.header_mut().mask = Some(mask);
        let mut wire = Vec::new();
        frame.format_unchecked(&mut wire).unwrap();
        wire
    }

    fn client_control(frame: Frame, mask: [u8; 4]) -> Vec<u8> {
        let mut frame = frame;
        frame.header_mut().mask = Some(mask);
        let mut wire = Vec::new();
        frame.format_unchecked(&mut wire).unwrap();
        wire
    }

    fn server_over(inbound: Vec<u8>) -> (Connection, SharedBuf) {
        let outbound = SharedBuf::new();
        let conn = Connection::new(
            Cursor::new(inbound),
            outbound.clone(),
            Role::Server,
            &UpgradeOptions::default(),
        );
        (conn, outbound)
    }

    /// Parse every unmasked frame the server emitted.
    fn emitted_frames(outbound: &SharedBuf) -> Vec<Frame> {
        let bytes = outbound.contents();
        let mut stream = Cursor::new(bytes);
        let mut codec = FrameCodec::new(4096, crate::MAX_FRAME_PAYLOAD);
        let mut frames = Vec::new();
        while let Ok(frame) = codec.read_frame(&mut stream, MaskingPolicy::Rejected) {
            frames.push(frame);
        }
        frames
    }

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    #[test]
    fn unfragmented_text_read() {
        let (conn, _out) = server_over(client_frame(Data::Text, b"Hello", true, MASK));
        assert_eq!(conn.read().unwrap(), Message::text("Hello"));
    }

    #[test]
    fn fragmented_message_with_interleaved_ping() {
        let mut inbound = client_frame(Data::Text, b"Part1", false, MASK);
        inbound.extend(client_control(Frame::ping(&b"ping"[..]), MASK));
        let mut continuation = Frame::data(Data::Continuation, &b"Part2"[..], true);
        continuation.header_mut().mask = Some(MASK);
        let mut wire = Vec::new();
        continuation.format_unchecked(&mut wire).unwrap();
        inbound.extend(wire);

        let (conn, out) = server_over(inbound);
        assert_eq!(conn.read().unwrap(), Message::text("Part1Part2"));

        let frames = emitted_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header().opcode, OpCode::Control(Control::Pong));
        assert_eq!(frames[0].payload(), b"ping");
    }

    #[test]
    fn invalid_utf8_closes_with_1007() {
        let (conn, out) = server_over(client_frame(Data::Text, &[0xFF, 0xFE], true, MASK));

        let err = conn.read().unwrap_err();
        assert!(matches!(err, Error::Utf8(_)));
        assert!(conn.is_closed());

        let frames = emitted_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header().opcode, OpCode::Control(Control::Close));
        assert_eq!(&frames[0].payload()[..2], &1007u16.to_be_bytes());
    }

    #[test]
    fn unexpected_continuation_closes_with_1002() {
        let (conn, out) = server_over(client_frame(Data::Continuation, b"oops", true, MASK));

        let err = conn.read().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedContinuation)));

        let frames = emitted_frames(&out);
        assert_eq!(&frames[0].payload()[..2], &1002u16.to_be_bytes());
    }

    #[test]
    fn data_frame_inside_fragment_chain_closes_with_1002() {
        let mut inbound = client_frame(Data::Text, b"Part1", false, MASK);
        inbound.extend(client_frame(Data::Text, b"again", true, MASK));

        let (conn, out) = server_over(inbound);
        let err = conn.read().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ExpectedContinuation)));
        assert_eq!(&emitted_frames(&out)[0].payload()[..2], &1002u16.to_be_bytes());
    }

    #[test]
    fn unmasked_client_frame_closes_with_1002() {
        let mut wire = Vec::new();
        Frame::data(Data::Text, &b"Hello"[..], true)
            .format_unchecked(&mut wire)
            .unwrap();

        let (conn, out) = server_over(wire);
        let err = conn.read().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::MaskRequired)));
        assert_eq!(&emitted_frames(&out)[0].payload()[..2], &1002u16.to_be_bytes());
    }

    #[test]
    fn oversized_fragment_chain_closes_with_1009() {
        let mut inbound = client_frame(Data::Binary, &[0u8; 64], false, MASK);
        let mut continuation = Frame::data(Data::Continuation, vec![0u8; 64], true);
        continuation.header_mut().mask = Some(MASK);
        let mut wire = Vec::new();
        continuation.format_unchecked(&mut wire).unwrap();
        inbound.extend(wire);

        let options = UpgradeOptions { max_message_size: 100, ..Default::default() };
        let out = SharedBuf::new();
        let conn = Connection::new(Cursor::new(inbound), out.clone(), Role::Server, &options);

        let err = conn.read().unwrap_err();
        assert!(matches!(err, Error::Capacity(CapacityError::MessageTooLarge { .. })));
        assert_eq!(&emitted_frames(&out)[0].payload()[..2], &1009u16.to_be_bytes());
    }

    #[test]
    fn close_frame_is_echoed_and_read_reports_closed() {
        let mut close = Frame::close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        close.header_mut().mask = Some(MASK);
        let mut wire = Vec::new();
        close.format_unchecked(&mut wire).unwrap();

        let (conn, out) = server_over(wire);
        let err = conn.read().unwrap_err();
        assert!(err.is_clean_close());
        assert!(conn.is_closed());

        let frames = emitted_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[..2], &1000u16.to_be_bytes());

        // Everything after the latch rejects.
        assert!(matches!(conn.read().unwrap_err(), Error::ConnectionClosed));
        assert!(matches!(conn.write_text("late").unwrap_err(), Error::ConnectionClosed));
        assert!(matches!(conn.ping(&b""[..]).unwrap_err(), Error::ConnectionClosed));
    }

    #[test]
    fn close_without_status_echoes_empty_payload() {
        let wire = client_control(Frame::close(None), MASK);
        let (conn, out) = server_over(wire);

        assert!(conn.read().unwrap_err().is_clean_close());
        let frames = emitted_frames(&out);
        assert_eq!(frames[0].header().opcode, OpCode::Control(Control::Close));
        assert!(frames[0].payload().is_empty(), "1005 must never reach the wire");
    }

    #[test]
    fn close_is_idempotent_with_one_emitted_frame() {
        let (conn, out) = server_over(Vec::new());

        conn.close().unwrap();
        conn.close().unwrap();
        conn.close_with(CloseCode::Away, "again").unwrap();

        let frames = emitted_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload()[..2], &1000u16.to_be_bytes());
    }

    #[test]
    fn close_with_pseudo_code_emits_empty_payload() {
        let (conn, out) = server_over(Vec::new());
        conn.close_with(CloseCode::Abnormal, "ignored").unwrap();

        let frames = emitted_frames(&out);
        assert!(frames[0].payload().is_empty());
    }

    #[test]
    fn server_writes_are_unmasked_single_frames() {
        let (conn, out) = server_over(Vec::new());
        conn.write_text("Hello").unwrap();

        assert_eq!(out.contents(), [&[0x81, 0x05][..], b"Hello"].concat());
    }

    #[test]
    fn client_writes_are_masked() {
        let out = SharedBuf::new();
        let conn = Connection::new(
            Cursor::new(Vec::new()),
            out.clone(),
            Role::Client,
            &UpgradeOptions::default(),
        );
        conn.write_text("Hello").unwrap();

        let wire = out.contents();
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x80 | 5, "mask bit set");
        let mask = [wire[2], wire[3], wire[4], wire[5]];
        let mut payload = wire[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn ping_payload_limit_enforced() {
        let (conn, _out) = server_over(Vec::new());
        let err = conn.ping(vec![0u8; 126]).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ControlTooLarge)));
        assert!(!conn.is_closed(), "local misuse does not kill the session");
    }

    #[test]
    fn read_text_rejects_binary() {
        let (conn, _out) = server_over(client_frame(Data::Binary, &[1, 2, 3], true, MASK));
        assert!(matches!(conn.read_text().unwrap_err(), Error::InvalidMessageType));
    }

    #[test]
    fn json_round_trip_between_roles() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Note {
            text: String,
            seq: u32,
        }

        // Client writes (masked), server reads.
        let wire = SharedBuf::new();
        let client = Connection::new(
            Cursor::new(Vec::new()),
            wire.clone(),
            Role::Client,
            &UpgradeOptions::default(),
        );
        client.write_json(&Note { text: "hi".into(), seq: 7 }).unwrap();

        let server = Connection::new(
            Cursor::new(wire.contents()),
            SharedBuf::new(),
            Role::Server,
            &UpgradeOptions::default(),
        );
        let note: Note = server.read_json().unwrap();
        assert_eq!(note, Note { text: "hi".into(), seq: 7 });
    }

    #[test]
    fn pong_frames_are_ignored() {
        let mut inbound = client_control(Frame::pong(&b"late"[..]), MASK);
        inbound.extend(client_frame(Data::Text, b"after", true, MASK));

        let (conn, _out) = server_over(inbound);
        assert_eq!(conn.read().unwrap(), Message::text("after"));
    }
}
