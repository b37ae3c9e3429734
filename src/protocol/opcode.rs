//! Operation codes and close status codes defined in RFC 6455.

use std::fmt::Display;

/// WebSocket frame opcode as in RFC 6455 Section 5.2.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpCode {
    /// Data (continuation, text or binary).
    Data(Data),
    /// Control (close, ping or pong).
    Control(Control),
}

/// Data opcodes.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Data {
    /// Extends the preceding data frame of a fragmented message.
    Continuation = 0x0,
    /// A UTF-8 text frame.
    Text = 0x1,
    /// A binary frame.
    Binary = 0x2,
}

/// Control opcodes.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Control {
    /// Starts or completes the close handshake.
    Close = 0x8,
    /// A ping, answered by a pong echoing its payload.
    Ping = 0x9,
    /// A pong, solicited or not.
    Pong = 0xA,
}

impl OpCode {
    /// Decode a 4-bit opcode field. Returns `None` for the reserved values
    /// 0x3-0x7 and 0xB-0xF.
    pub fn from_u4(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Data(Data::Continuation)),
            0x1 => Some(Self::Data(Data::Text)),
            0x2 => Some(Self::Data(Data::Binary)),
            0x8 => Some(Self::Control(Control::Close)),
            0x9 => Some(Self::Control(Control::Ping)),
            0xA => Some(Self::Control(Control::Pong)),
            _ => None,
        }
    }

    /// Whether this is a control opcode.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Whether this is a data opcode.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Data(_))
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Data(d) => d as u8,
            OpCode::Control(c) => c as u8,
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Continuation => write!(f, "CONTINUE"),
            Self::Text => write!(f, "TEXT"),
            Self::Binary => write!(f, "BINARY"),
        }
    }
}

impl Display for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Close => write!(f, "CLOSE"),
            Self::Ping => write!(f, "PING"),
            Self::Pong => write!(f, "PONG"),
        }
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Data(d) => d.fmt(f),
            Self::Control(c) => c.fmt(f),
        }
    }
}

/// Status code carried by a close frame (RFC 6455 Section 7.4).
///
/// The pseudo-codes [`Status`](CloseCode::Status),
/// [`Abnormal`](CloseCode::Abnormal) and [`Tls`](CloseCode::Tls) describe
/// local conditions only and are never written on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: normal closure, the purpose of the connection is fulfilled.
    Normal,
    /// 1001: endpoint going away (server shutdown, page navigated off).
    Away,
    /// 1002: protocol violation.
    Protocol,
    /// 1003: received a data type the endpoint cannot accept.
    Unsupported,
    /// 1005: no status code was present in the close frame. Local only.
    Status,
    /// 1006: the transport dropped without a close handshake. Local only.
    Abnormal,
    /// 1007: message payload inconsistent with its type (bad UTF-8 in text).
    Invalid,
    /// 1008: message violated the endpoint's policy.
    Policy,
    /// 1009: message too big to process.
    Size,
    /// 1010: client expected an extension the server did not negotiate.
    Extension,
    /// 1011: server hit an unexpected condition.
    Error,
    /// 1012: service is restarting.
    Restart,
    /// 1013: try again later (e.g. overload).
    Again,
    /// 1015: TLS handshake failure. Local only.
    Tls,
    /// Other codes in the 1000-2999 protocol range.
    Reserved(u16),
    /// 3000-3999: registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private application use.
    Library(u16),
    /// Anything outside the defined ranges.
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may be placed on the wire. The reserved
    /// pseudo-codes and out-of-range values may not.
    pub fn is_sendable(self) -> bool {
        !matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_) | Self::Bad(_)
        )
    }
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> u16 {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            1004 | 1014 | 1016..=2999 => Self::Reserved(value),
            3000..=3999 => Self::Iana(value),
            4000..=4999 => Self::Library(value),
            _ => Self::Bad(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_u4_round_trip() {
        for value in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            let opcode = OpCode::from_u4(value).unwrap();
            assert_eq!(u8::from(opcode), value);
        }
    }

    #[test]
    fn reserved_opcodes_rejected() {
        for value in (0x3u8..=0x7).chain(0xB..=0xF) {
            assert!(OpCode::from_u4(value).is_none(), "0x{value:X} must be reserved");
        }
    }

    #[test]
    fn control_classification() {
        assert!(OpCode::Control(Control::Ping).is_control());
        assert!(OpCode::Data(Data::Text).is_data());
        assert!(!OpCode::Data(Data::Continuation).is_control());
    }

    #[test]
    fn close_code_u16_round_trip() {
        for code in 1000u16..=1015 {
            if code == 1004 || code == 1014 {
                continue;
            }
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
        assert_eq!(CloseCode::from(3000), CloseCode::Iana(3000));
        assert_eq!(CloseCode::from(4321), CloseCode::Library(4321));
        assert_eq!(CloseCode::from(500), CloseCode::Bad(500));
    }

    #[test]
    fn pseudo_codes_not_sendable() {
        assert!(!CloseCode::Status.is_sendable());
        assert!(!CloseCode::Abnormal.is_sendable());
        assert!(!CloseCode::Tls.is_sendable());
        assert!(CloseCode::Normal.is_sendable());
        assert!(CloseCode::Library(4000).is_sendable());
        assert!(CloseCode::Iana(3000).is_sendable());
    }
}
