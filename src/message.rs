//! Typed protocol messages and their wire preambles.
//!
//! The core treats message bodies as opaque serializer output; everything it
//! needs for routing lives in a small preamble written in a fixed layout:
//! the call identifier, stream sequence numbers, request option bits, and
//! fault codes. [`ProtocolMessage`] pairs the decoded preamble with the
//! untouched body bytes so the dispatcher can route without deserializing.

use bytes::{Buf, Bytes};

use crate::{
    byte_order::{write_network_u16, write_network_u64},
    error::{CommError, CommResult, RetCode},
    frame::MessageKind,
};

/// Request option bit: the caller may cancel this request.
pub const REQUEST_CANCELLABLE: u8 = 0b0000_0001;
/// Request option bit: the caller will send stream pages for this call.
pub const REQUEST_STREAM_IN: u8 = 0b0000_0010;
/// Request option bit: the caller expects stream pages for this call.
pub const REQUEST_STREAM_OUT: u8 = 0b0000_0100;

/// Stable, globally-unique call identifier chosen by the initiator.
///
/// Echoed in every message related to the call. The string form is
/// `"{channel_id}/{counter}"` for locally originated calls, but any unique
/// string a peer presents is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    /// Wrap an externally supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// Derive the next identifier for a channel from its monotonic counter.
    #[must_use]
    pub fn next_for(channel_id: u64, counter: u64) -> Self { Self(format!("{channel_id}/{counter}")) }

    /// Borrow the string form.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Login credentials carried by the handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Account or peer name.
    pub username: String,
    /// Shared secret; opaque to the core.
    pub secret: String,
}

impl Credentials {
    /// Build a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// A decoded wire message: routing preamble plus opaque body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Request expecting a response; `options` carries the request bits.
    Request {
        call_id: CallId,
        options: u8,
        body: Bytes,
    },
    /// Successful response to a request.
    Response { call_id: CallId, body: Bytes },
    /// Fault response to a request.
    Fault { call_id: CallId, error: CommError },
    /// One-way user message; no correlation, no response.
    Message { body: Bytes },
    /// Batched stream items for a call.
    StreamPage {
        call_id: CallId,
        seq: u64,
        body: Bytes,
    },
    /// Acknowledgement restoring one page of send credit.
    StreamAck { call_id: CallId, seq: u64 },
    /// Terminal marker for the sender's direction of a stream call.
    StreamCompletion {
        call_id: CallId,
        error: Option<CommError>,
    },
    /// Session handshake: login request.
    Login { credentials: Credentials },
    /// Session handshake: login outcome.
    LoginResponse { error: Option<CommError> },
    /// Session handshake: logout request.
    Logout,
    /// Session handshake: logout confirmation.
    LogoutResponse,
    /// Best-effort cancellation of an in-flight request.
    Cancel { call_id: CallId },
}

impl ProtocolMessage {
    /// Frame kind for this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::Request { .. } => MessageKind::Request,
            ProtocolMessage::Response { .. } => MessageKind::Response,
            ProtocolMessage::Fault { .. } => MessageKind::Fault,
            ProtocolMessage::Message { .. } => MessageKind::Message,
            ProtocolMessage::StreamPage { .. } => MessageKind::StreamPage,
            ProtocolMessage::StreamAck { .. } => MessageKind::StreamAck,
            ProtocolMessage::StreamCompletion { .. } => MessageKind::StreamCompletion,
            ProtocolMessage::Login { .. } => MessageKind::Login,
            ProtocolMessage::LoginResponse { .. } => MessageKind::LoginResponse,
            ProtocolMessage::Logout => MessageKind::Logout,
            ProtocolMessage::LogoutResponse => MessageKind::LogoutResponse,
            ProtocolMessage::Cancel { .. } => MessageKind::Cancel,
        }
    }

    /// Call identifier referenced by this message, if any.
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ProtocolMessage::Request { call_id, .. }
            | ProtocolMessage::Response { call_id, .. }
            | ProtocolMessage::Fault { call_id, .. }
            | ProtocolMessage::StreamPage { call_id, .. }
            | ProtocolMessage::StreamAck { call_id, .. }
            | ProtocolMessage::StreamCompletion { call_id, .. }
            | ProtocolMessage::Cancel { call_id } => Some(call_id),
            _ => None,
        }
    }

    /// Encode the routing preamble into `out`.
    ///
    /// The opaque body (where present) is not included; the frame writer
    /// appends it after the preamble.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::SerializationError`] when a string field exceeds
    /// the `u16` length prefix.
    pub fn encode_preamble(&self, out: &mut Vec<u8>) -> CommResult<()> {
        match self {
            ProtocolMessage::Request {
                call_id, options, ..
            } => {
                write_str(out, call_id.as_str())?;
                out.push(*options);
            }
            ProtocolMessage::Response { call_id, .. } => write_str(out, call_id.as_str())?,
            ProtocolMessage::Fault { call_id, error } => {
                write_str(out, call_id.as_str())?;
                out.push(error.code.to_u8());
                write_str(out, &error.message)?;
                if let Some(fault) = &error.fault {
                    out.extend_from_slice(fault);
                }
            }
            ProtocolMessage::Message { .. } => {}
            ProtocolMessage::StreamPage { call_id, seq, .. } => {
                write_str(out, call_id.as_str())?;
                out.extend_from_slice(&write_network_u64(*seq));
            }
            ProtocolMessage::StreamAck { call_id, seq } => {
                write_str(out, call_id.as_str())?;
                out.extend_from_slice(&write_network_u64(*seq));
            }
            ProtocolMessage::StreamCompletion { call_id, error } => {
                write_str(out, call_id.as_str())?;
                encode_opt_error(out, error.as_ref())?;
            }
            ProtocolMessage::Login { credentials } => {
                write_str(out, &credentials.username)?;
                write_str(out, &credentials.secret)?;
            }
            ProtocolMessage::LoginResponse { error } => encode_opt_error(out, error.as_ref())?,
            ProtocolMessage::Logout | ProtocolMessage::LogoutResponse => {}
            ProtocolMessage::Cancel { call_id } => write_str(out, call_id.as_str())?,
        }
        Ok(())
    }

    /// Opaque body carried after the preamble, if any.
    #[must_use]
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            ProtocolMessage::Request { body, .. }
            | ProtocolMessage::Response { body, .. }
            | ProtocolMessage::Message { body }
            | ProtocolMessage::StreamPage { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Decode a message from a reassembled frame payload.
    ///
    /// `payload` must contain the preamble followed by the opaque body; the
    /// body is sliced out without copying.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::ProtocolViolation`] when the preamble is truncated
    /// or malformed.
    pub fn decode(kind: MessageKind, mut payload: Bytes) -> CommResult<Self> {
        Ok(match kind {
            MessageKind::Request => {
                let call_id = read_call_id(&mut payload)?;
                let options = read_u8(&mut payload)?;
                ProtocolMessage::Request {
                    call_id,
                    options,
                    body: payload,
                }
            }
            MessageKind::Response => {
                let call_id = read_call_id(&mut payload)?;
                ProtocolMessage::Response {
                    call_id,
                    body: payload,
                }
            }
            MessageKind::Fault => {
                let call_id = read_call_id(&mut payload)?;
                let code = RetCode::from_u8(read_u8(&mut payload)?);
                let message = read_str(&mut payload)?;
                let mut error = CommError::new(code, message);
                if !payload.is_empty() {
                    error = error.with_fault(payload);
                }
                ProtocolMessage::Fault { call_id, error }
            }
            MessageKind::Message => ProtocolMessage::Message { body: payload },
            MessageKind::StreamPage => {
                let call_id = read_call_id(&mut payload)?;
                let seq = read_u64(&mut payload)?;
                ProtocolMessage::StreamPage {
                    call_id,
                    seq,
                    body: payload,
                }
            }
            MessageKind::StreamAck => {
                let call_id = read_call_id(&mut payload)?;
                let seq = read_u64(&mut payload)?;
                ProtocolMessage::StreamAck { call_id, seq }
            }
            MessageKind::StreamCompletion => {
                let call_id = read_call_id(&mut payload)?;
                let error = decode_opt_error(&mut payload)?;
                ProtocolMessage::StreamCompletion { call_id, error }
            }
            MessageKind::Login => {
                let username = read_str(&mut payload)?;
                let secret = read_str(&mut payload)?;
                ProtocolMessage::Login {
                    credentials: Credentials { username, secret },
                }
            }
            MessageKind::LoginResponse => ProtocolMessage::LoginResponse {
                error: decode_opt_error(&mut payload)?,
            },
            MessageKind::Logout => ProtocolMessage::Logout,
            MessageKind::LogoutResponse => ProtocolMessage::LogoutResponse,
            MessageKind::Cancel => ProtocolMessage::Cancel {
                call_id: read_call_id(&mut payload)?,
            },
        })
    }
}

fn write_str(out: &mut Vec<u8>, value: &str) -> CommResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        CommError::new(
            RetCode::SerializationError,
            format!("string field of {} bytes exceeds the u16 prefix", value.len()),
        )
    })?;
    out.extend_from_slice(&write_network_u16(len));
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn encode_opt_error(out: &mut Vec<u8>, error: Option<&CommError>) -> CommResult<()> {
    match error {
        None => out.push(0),
        Some(error) => {
            out.push(1);
            out.push(error.code.to_u8());
            write_str(out, &error.message)?;
        }
    }
    Ok(())
}

fn truncated() -> CommError { CommError::new(RetCode::ProtocolViolation, "truncated preamble") }

fn read_u8(buf: &mut Bytes) -> CommResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn read_u64(buf: &mut Bytes) -> CommResult<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn read_str(buf: &mut Bytes) -> CommResult<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| CommError::new(RetCode::ProtocolViolation, "string field is not utf-8"))
}

fn read_call_id(buf: &mut Bytes) -> CommResult<CallId> { Ok(CallId::new(read_str(buf)?)) }

fn decode_opt_error(buf: &mut Bytes) -> CommResult<Option<CommError>> {
    match read_u8(buf)? {
        0 => Ok(None),
        _ => {
            let code = RetCode::from_u8(read_u8(buf)?);
            let message = read_str(buf)?;
            Ok(Some(CommError::new(code, message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &ProtocolMessage) -> ProtocolMessage {
        let mut payload = Vec::new();
        msg.encode_preamble(&mut payload).expect("preamble");
        if let Some(body) = msg.body() {
            payload.extend_from_slice(body);
        }
        ProtocolMessage::decode(msg.kind(), Bytes::from(payload)).expect("decode")
    }

    #[test]
    fn request_preamble_roundtrip() {
        let msg = ProtocolMessage::Request {
            call_id: CallId::next_for(3, 41),
            options: REQUEST_CANCELLABLE | REQUEST_STREAM_OUT,
            body: Bytes::from_static(b"payload"),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn fault_carries_code_message_and_payload() {
        let msg = ProtocolMessage::Fault {
            call_id: CallId::new("7/1"),
            error: CommError::new(RetCode::RequestFault, "division by zero")
                .with_fault(Bytes::from_static(b"\x01\x02")),
        };
        match roundtrip(&msg) {
            ProtocolMessage::Fault { error, .. } => {
                assert_eq!(error.code, RetCode::RequestFault);
                assert_eq!(error.message, "division by zero");
                assert_eq!(error.fault.as_deref(), Some(b"\x01\x02".as_ref()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn stream_page_keeps_sequence_and_body() {
        let msg = ProtocolMessage::StreamPage {
            call_id: CallId::new("1/9"),
            seq: 17,
            body: Bytes::from(vec![0u8; 64]),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn handshake_messages_roundtrip() {
        let login = ProtocolMessage::Login {
            credentials: Credentials::new("svc", "hunter2"),
        };
        assert_eq!(roundtrip(&login), login);

        let refused = ProtocolMessage::LoginResponse {
            error: Some(CommError::new(RetCode::InvalidCredentials, "no such account")),
        };
        assert_eq!(roundtrip(&refused), refused);
        assert_eq!(roundtrip(&ProtocolMessage::Logout), ProtocolMessage::Logout);
    }

    #[test]
    fn truncated_preamble_is_a_protocol_violation() {
        let err = ProtocolMessage::decode(MessageKind::StreamAck, Bytes::from_static(b"\x00\x011"))
            .expect_err("must fail");
        assert_eq!(err.code, RetCode::ProtocolViolation);
    }
}
