//! Wire frame header.
//!
//! Every message on the transport begins with a fixed-width header: a 4-byte
//! big-endian body length, a kind byte, and a flag byte. The flag byte
//! carries the chunking indicator, allowing a message larger than one segment
//! to travel as a run of frames the receiver stitches back together. A
//! single frame never declares a body longer than [`MAX_CHUNK_BODY`].

use crate::{
    byte_order::{read_network_u32, write_network_u32},
    error::{CommError, CommResult, RetCode},
};

/// Fixed width of the frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Upper bound on a single frame's declared body length (16 MiB).
///
/// Chunking keeps real frames at segment granularity; the bound only guards
/// the parser against corrupt length prefixes.
pub const MAX_CHUNK_BODY: usize = 16 * 1024 * 1024;

/// Flag bit: this frame continues the payload of a preceding frame.
pub const FLAG_CHUNK_CONT: u8 = 0b0000_0001;
/// Flag bit: further continuation frames follow this one.
pub const FLAG_CHUNK_MORE: u8 = 0b0000_0010;

/// Kind of a wire message, carried in the frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Request expecting a response.
    Request,
    /// Response to a request.
    Response,
    /// Fault response to a request.
    Fault,
    /// One-way user message without correlation.
    Message,
    /// Batched stream items for a call.
    StreamPage,
    /// Acknowledgement restoring a page of send credit.
    StreamAck,
    /// Terminal marker for one direction of a stream call.
    StreamCompletion,
    /// Session handshake: login request.
    Login,
    /// Session handshake: login outcome.
    LoginResponse,
    /// Session handshake: logout request.
    Logout,
    /// Session handshake: logout confirmation.
    LogoutResponse,
    /// Best-effort request cancellation.
    Cancel,
}

impl MessageKind {
    /// Wire representation of the kind.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            MessageKind::Request => 0,
            MessageKind::Response => 1,
            MessageKind::Fault => 2,
            MessageKind::Message => 3,
            MessageKind::StreamPage => 4,
            MessageKind::StreamAck => 5,
            MessageKind::StreamCompletion => 6,
            MessageKind::Login => 7,
            MessageKind::LoginResponse => 8,
            MessageKind::Logout => 9,
            MessageKind::LogoutResponse => 10,
            MessageKind::Cancel => 11,
        }
    }

    /// Decode a kind byte.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::ProtocolViolation`] for unknown kind values.
    pub fn from_u8(value: u8) -> CommResult<Self> {
        Ok(match value {
            0 => MessageKind::Request,
            1 => MessageKind::Response,
            2 => MessageKind::Fault,
            3 => MessageKind::Message,
            4 => MessageKind::StreamPage,
            5 => MessageKind::StreamAck,
            6 => MessageKind::StreamCompletion,
            7 => MessageKind::Login,
            8 => MessageKind::LoginResponse,
            9 => MessageKind::Logout,
            10 => MessageKind::LogoutResponse,
            11 => MessageKind::Cancel,
            other => {
                return Err(CommError::new(
                    RetCode::ProtocolViolation,
                    format!("unknown message kind: {other}"),
                ));
            }
        })
    }

    /// Returns true for the session-handshake kinds owned by the coordinator.
    #[must_use]
    pub fn is_session_control(self) -> bool {
        matches!(
            self,
            MessageKind::Login
                | MessageKind::LoginResponse
                | MessageKind::Logout
                | MessageKind::LogoutResponse
        )
    }
}

/// Parsed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Length of the body following this header.
    pub body_len: u32,
    /// Message kind.
    pub kind: MessageKind,
    /// Flag bits; see [`FLAG_CHUNK_CONT`] and [`FLAG_CHUNK_MORE`].
    pub flags: u8,
}

impl MessageHeader {
    /// Build a header for a frame of `body_len` bytes.
    #[must_use]
    pub fn new(body_len: u32, kind: MessageKind, flags: u8) -> Self {
        Self {
            body_len,
            kind,
            flags,
        }
    }

    /// True when this frame continues a preceding frame's payload.
    #[must_use]
    pub fn is_continuation(&self) -> bool { self.flags & FLAG_CHUNK_CONT != 0 }

    /// True when further continuation frames follow.
    #[must_use]
    pub fn has_more(&self) -> bool { self.flags & FLAG_CHUNK_MORE != 0 }

    /// Encode the header into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than [`HEADER_LEN`].
    pub fn encode(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&write_network_u32(self.body_len));
        dst[4] = self.kind.to_u8();
        dst[5] = self.flags;
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::ProtocolViolation`] when the kind byte is unknown
    /// or the declared body length exceeds [`MAX_CHUNK_BODY`].
    pub fn decode(src: &[u8]) -> CommResult<Self> {
        debug_assert!(src.len() >= HEADER_LEN);
        let body_len = read_network_u32([src[0], src[1], src[2], src[3]]);
        if body_len as usize > MAX_CHUNK_BODY {
            return Err(CommError::new(
                RetCode::ProtocolViolation,
                format!("frame body length {body_len} exceeds limit"),
            ));
        }
        let kind = MessageKind::from_u8(src[4])?;
        Ok(Self {
            body_len,
            kind,
            flags: src[5],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = MessageHeader::new(512, MessageKind::StreamPage, FLAG_CHUNK_MORE);
        let mut buf = [0u8; HEADER_LEN];
        header.encode(&mut buf);
        let decoded = MessageHeader::decode(&buf).expect("decode");
        assert_eq!(decoded, header);
        assert!(decoded.has_more());
        assert!(!decoded.is_continuation());
    }

    #[test]
    fn unknown_kind_is_a_protocol_violation() {
        let mut buf = [0u8; HEADER_LEN];
        MessageHeader::new(0, MessageKind::Request, 0).encode(&mut buf);
        buf[4] = 0xEE;
        let err = MessageHeader::decode(&buf).expect_err("must fail");
        assert_eq!(err.code, RetCode::ProtocolViolation);
    }

    #[test]
    fn oversized_body_length_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&write_network_u32(u32::MAX));
        buf[4] = MessageKind::Message.to_u8();
        let err = MessageHeader::decode(&buf).expect_err("must fail");
        assert_eq!(err.code, RetCode::ProtocolViolation);
    }

    #[test]
    fn kind_byte_roundtrip() {
        for value in 0..=11u8 {
            let kind = MessageKind::from_u8(value).expect("known kind");
            assert_eq!(kind.to_u8(), value);
        }
        assert!(MessageKind::from_u8(12).is_err());
    }
}
