//! Canonical error and result types for the crate.
//!
//! Every component reports failures through a single taxonomy: a [`RetCode`]
//! naming the failure class and a [`CommError`] carrying the code, a
//! human-readable message, and an optional opaque fault payload supplied by
//! the remote side.

use bytes::Bytes;
use thiserror::Error;

/// Outcome code shared by every layer of the connection core.
///
/// The code distinguishes transport failures, protocol violations, handshake
/// failures, and service-side logical errors so callers can react without
/// parsing messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetCode {
    /// Success.
    Ok,
    /// Malformed frame, unexpected message, or unknown-call response.
    ProtocolViolation,
    /// Operation illegal in the current channel state.
    InvalidChannelState,
    /// Login refused by the remote side.
    InvalidCredentials,
    /// Graceful close initiated locally.
    ChannelClosed,
    /// Graceful close initiated by the peer.
    ChannelClosedByOtherSide,
    /// Transport shut down while an operation was in flight.
    ConnectionShutdown,
    /// Transport aborted by the peer (reset, broken pipe).
    ConnectionAbortedByPeer,
    /// Transport-level timeout.
    ConnectionTimeout,
    /// Login handshake did not complete in time.
    LoginTimeout,
    /// Logout handshake did not complete in time.
    LogoutTimeout,
    /// TLS negotiation failure.
    SecurityError,
    /// Outgoing message could not be encoded.
    SerializationError,
    /// Incoming payload could not be decoded.
    DeserializationError,
    /// Message arrived for an unknown or wrong-phase call.
    UnexpectedMessage,
    /// Caller or system cancellation.
    OperationCanceled,
    /// Service-side logical failure reported by a handler.
    RequestFault,
    /// Service-side handler raised an unhandled panic.
    RequestCrash,
    /// One-way message handler raised.
    MessageHandlerCrash,
    /// Channel event observer raised.
    EventHandlerCrash,
    /// Session init handler raised.
    InitHandlerCrash,
    /// Write attempted after the stream was completed or closed.
    StreamCompleted,
    /// Address resolution produced no candidates.
    HostNotFound,
    /// Route to the host is unavailable.
    HostUnreachable,
    /// The remote endpoint refused the connection.
    ConnectionRefused,
    /// Connection-related failure not covered by a specific code.
    OtherConnectionError,
    /// Non-connection failure not covered by a specific code.
    OtherError,
    /// Failure of unknown origin.
    UnknownError,
}

impl RetCode {
    /// Returns true for the success code.
    #[must_use]
    pub fn is_ok(self) -> bool { self == RetCode::Ok }

    /// Wire representation of the code.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            RetCode::Ok => 0,
            RetCode::ProtocolViolation => 1,
            RetCode::InvalidChannelState => 2,
            RetCode::InvalidCredentials => 3,
            RetCode::ChannelClosed => 4,
            RetCode::ChannelClosedByOtherSide => 5,
            RetCode::ConnectionShutdown => 6,
            RetCode::ConnectionAbortedByPeer => 7,
            RetCode::ConnectionTimeout => 8,
            RetCode::LoginTimeout => 9,
            RetCode::LogoutTimeout => 10,
            RetCode::SecurityError => 11,
            RetCode::SerializationError => 12,
            RetCode::DeserializationError => 13,
            RetCode::UnexpectedMessage => 14,
            RetCode::OperationCanceled => 15,
            RetCode::RequestFault => 16,
            RetCode::RequestCrash => 17,
            RetCode::MessageHandlerCrash => 18,
            RetCode::EventHandlerCrash => 19,
            RetCode::InitHandlerCrash => 20,
            RetCode::StreamCompleted => 21,
            RetCode::HostNotFound => 22,
            RetCode::HostUnreachable => 23,
            RetCode::ConnectionRefused => 24,
            RetCode::OtherConnectionError => 25,
            RetCode::OtherError => 26,
            RetCode::UnknownError => 27,
        }
    }

    /// Decode a wire code; unknown values map to [`RetCode::UnknownError`].
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => RetCode::Ok,
            1 => RetCode::ProtocolViolation,
            2 => RetCode::InvalidChannelState,
            3 => RetCode::InvalidCredentials,
            4 => RetCode::ChannelClosed,
            5 => RetCode::ChannelClosedByOtherSide,
            6 => RetCode::ConnectionShutdown,
            7 => RetCode::ConnectionAbortedByPeer,
            8 => RetCode::ConnectionTimeout,
            9 => RetCode::LoginTimeout,
            10 => RetCode::LogoutTimeout,
            11 => RetCode::SecurityError,
            12 => RetCode::SerializationError,
            13 => RetCode::DeserializationError,
            14 => RetCode::UnexpectedMessage,
            15 => RetCode::OperationCanceled,
            16 => RetCode::RequestFault,
            17 => RetCode::RequestCrash,
            18 => RetCode::MessageHandlerCrash,
            19 => RetCode::EventHandlerCrash,
            20 => RetCode::InitHandlerCrash,
            21 => RetCode::StreamCompleted,
            22 => RetCode::HostNotFound,
            23 => RetCode::HostUnreachable,
            24 => RetCode::ConnectionRefused,
            25 => RetCode::OtherConnectionError,
            26 => RetCode::OtherError,
            _ => RetCode::UnknownError,
        }
    }

    /// Category string used as a log field.
    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            RetCode::Ok => "ok",
            RetCode::ProtocolViolation
            | RetCode::UnexpectedMessage
            | RetCode::SerializationError
            | RetCode::DeserializationError => "protocol",
            RetCode::InvalidChannelState | RetCode::OperationCanceled => "state",
            RetCode::InvalidCredentials
            | RetCode::LoginTimeout
            | RetCode::LogoutTimeout
            | RetCode::SecurityError => "session",
            RetCode::ChannelClosed
            | RetCode::ChannelClosedByOtherSide
            | RetCode::ConnectionShutdown
            | RetCode::ConnectionAbortedByPeer
            | RetCode::ConnectionTimeout
            | RetCode::HostNotFound
            | RetCode::HostUnreachable
            | RetCode::ConnectionRefused
            | RetCode::OtherConnectionError => "transport",
            RetCode::RequestFault
            | RetCode::RequestCrash
            | RetCode::MessageHandlerCrash
            | RetCode::EventHandlerCrash
            | RetCode::InitHandlerCrash => "handler",
            RetCode::StreamCompleted => "stream",
            RetCode::OtherError | RetCode::UnknownError => "other",
        }
    }
}

/// Communication failure surfaced to callers.
///
/// Wraps a [`RetCode`] with a message and, for service-side faults, an
/// opaque payload the caller may decode with its own serializer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct CommError {
    /// Failure class.
    pub code: RetCode,
    /// Human-readable context.
    pub message: String,
    /// Opaque fault body supplied by the remote side, if any.
    pub fault: Option<Bytes>,
}

impl CommError {
    /// Build an error with a message.
    #[must_use]
    pub fn new(code: RetCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fault: None,
        }
    }

    /// Build an error from a bare code.
    #[must_use]
    pub fn code(code: RetCode) -> Self { Self::new(code, "") }

    /// Attach an opaque fault payload.
    #[must_use]
    pub fn with_fault(mut self, fault: Bytes) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Translate a transport I/O error into the taxonomy.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match error.kind() {
            ErrorKind::ConnectionRefused => RetCode::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                RetCode::ConnectionAbortedByPeer
            }
            ErrorKind::TimedOut => RetCode::ConnectionTimeout,
            ErrorKind::UnexpectedEof => RetCode::ConnectionAbortedByPeer,
            ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => RetCode::HostUnreachable,
            ErrorKind::NotFound => RetCode::HostNotFound,
            ErrorKind::InvalidData => RetCode::ProtocolViolation,
            _ => RetCode::OtherConnectionError,
        };
        Self::new(code, error.to_string())
    }
}

/// Canonical result alias used across the crate.
pub type CommResult<T> = std::result::Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_code_wire_roundtrip() {
        for value in 0..=27u8 {
            let code = RetCode::from_u8(value);
            assert_eq!(code.to_u8(), value);
        }
        assert_eq!(RetCode::from_u8(200), RetCode::UnknownError);
    }

    #[test]
    fn io_error_translation_maps_reset_to_peer_abort() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(CommError::from_io(&io).code, RetCode::ConnectionAbortedByPeer);
    }

    #[test]
    fn fault_payload_is_preserved() {
        let err =
            CommError::new(RetCode::RequestFault, "boom").with_fault(Bytes::from_static(b"ctx"));
        assert_eq!(err.fault.as_deref(), Some(b"ctx".as_ref()));
        assert_eq!(err.code.category(), "handler");
    }
}
