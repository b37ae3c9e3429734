//! Application-visible messages and fragment reassembly.

use bytes::{Bytes, BytesMut};

use crate::{
    error::{CapacityError, Error, Result},
    protocol::utf8::Utf8Bytes,
};

/// A complete WebSocket message as surfaced to the application. Control
/// traffic (ping, pong, close) is handled inside the connection and never
/// appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text message.
    Text(Utf8Bytes),
    /// A binary message.
    Binary(Bytes),
}

impl Message {
    /// Create a text message.
    pub fn text<S: Into<Utf8Bytes>>(string: S) -> Message {
        Message::Text(string.into())
    }

    /// Create a binary message.
    pub fn binary<B: Into<Bytes>>(bytes: B) -> Message {
        Message::Binary(bytes.into())
    }

    /// Whether this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Whether this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(s) => s.len(),
            Message::Binary(b) => b.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the message, keeping the payload bytes.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(s) => s.into(),
            Message::Binary(b) => b,
        }
    }

    /// Borrow the payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(s) => s.as_ref(),
            Message::Binary(b) => b,
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(value: String) -> Self {
        Message::text(value)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(value: &'s str) -> Self {
        Message::text(value)
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Message::binary(value)
    }
}

impl From<Bytes> for Message {
    #[inline]
    fn from(value: Bytes) -> Self {
        Message::binary(value)
    }
}

impl From<Message> for Bytes {
    #[inline]
    fn from(value: Message) -> Self {
        value.into_data()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Text(s) => write!(f, "Text({s})"),
            Message::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
        }
    }
}

mod string_lib {
    use utf8::DecodeError;

    use crate::error::{Error, Result};

    /// Accumulates text fragments, validating UTF-8 incrementally so a
    /// character straddling a fragment boundary is accepted while truly
    /// malformed input fails as soon as it is seen.
    #[derive(Debug)]
    pub struct StringCollector {
        data: String,
        incomplete: Option<utf8::Incomplete>,
    }

    impl StringCollector {
        pub fn new() -> Self {
            StringCollector { data: String::new(), incomplete: None }
        }

        pub fn len(&self) -> usize {
            self.data
                .len()
                .saturating_add(self.incomplete.map(|i| i.buffer_len as usize).unwrap_or(0))
        }

        pub fn extend<T: AsRef<[u8]>>(&mut self, tail: T) -> Result<()> {
            let mut input: &[u8] = tail.as_ref();

            if let Some(mut incomplete) = self.incomplete.take() {
                if let Some((result, remaining)) = incomplete.try_complete(input) {
                    input = remaining;

                    match result {
                        Ok(s) => self.data.push_str(s),
                        Err(invalid) => {
                            return Err(Error::Utf8(String::from_utf8_lossy(invalid).into()));
                        }
                    }
                } else {
                    input = &[];
                    self.incomplete = Some(incomplete);
                }
            }

            if input.is_empty() {
                return Ok(());
            }

            match utf8::decode(input) {
                Ok(s) => {
                    self.data.push_str(s);
                    Ok(())
                }
                Err(DecodeError::Incomplete { valid_prefix, incomplete_suffix }) => {
                    self.data.push_str(valid_prefix);
                    self.incomplete = Some(incomplete_suffix);
                    Ok(())
                }
                Err(DecodeError::Invalid { valid_prefix, invalid_sequence, .. }) => {
                    self.data.push_str(valid_prefix);
                    Err(Error::Utf8(String::from_utf8_lossy(invalid_sequence).into()))
                }
            }
        }

        pub fn into_string(self) -> Result<String> {
            if let Some(incomplete) = self.incomplete {
                Err(Error::Utf8(format!("incomplete character at end of input: {incomplete:?}")))
            } else {
                Ok(self.data)
            }
        }
    }
}

/// Reassembly buffer for one fragmented message. Created from the first
/// non-final data frame, extended by each continuation, and completed by
/// the final one.
#[derive(Debug)]
pub struct IncompleteMessage {
    collector: IncompleteMessageCollector,
}

#[derive(Debug)]
enum IncompleteMessageCollector {
    Text(string_lib::StringCollector),
    Binary(BytesMut),
}

/// The data type opened by the first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteMessageType {
    /// The fragment chain started with a text opcode.
    Text,
    /// The fragment chain started with a binary opcode.
    Binary,
}

impl IncompleteMessage {
    /// Start collecting a fragmented message of the given type.
    pub fn new(message_type: IncompleteMessageType) -> Self {
        IncompleteMessage {
            collector: match message_type {
                IncompleteMessageType::Text => {
                    IncompleteMessageCollector::Text(string_lib::StringCollector::new())
                }
                IncompleteMessageType::Binary => {
                    IncompleteMessageCollector::Binary(BytesMut::new())
                }
            },
        }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        match &self.collector {
            IncompleteMessageCollector::Text(t) => t.len(),
            IncompleteMessageCollector::Binary(b) => b.len(),
        }
    }

    /// Whether nothing has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a fragment, rejecting growth past `max`.
    pub fn extend<T: AsRef<[u8]>>(&mut self, tail: T, max: usize) -> Result<()> {
        let size = self.len();
        let portion = tail.as_ref().len();

        if size > max || portion > max - size {
            return Err(Error::Capacity(CapacityError::MessageTooLarge {
                size: size + portion,
                max,
            }));
        }

        match &mut self.collector {
            IncompleteMessageCollector::Text(t) => t.extend(tail),
            IncompleteMessageCollector::Binary(b) => {
                b.extend_from_slice(tail.as_ref());
                Ok(())
            }
        }
    }

    /// Finish the chain and produce the message.
    pub fn complete(self) -> Result<Message> {
        match self.collector {
            IncompleteMessageCollector::Text(t) => Ok(Message::Text(t.into_string()?.into())),
            IncompleteMessageCollector::Binary(b) => Ok(Message::Binary(b.freeze())),
        }
    }
}
