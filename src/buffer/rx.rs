//! Inbound byte buffer and frame parser.
//!
//! The transport reads straight into the writable tail of the buffer
//! ([`RxBuffer::rx_window`] / [`RxBuffer::commit_rx`]); the parser then
//! walks complete frames off the front, stitching continuation chunks back
//! into whole message payloads. Consumed bytes are reclaimed by the
//! underlying `BytesMut`, so the buffer never grows past one partial
//! message plus one receive window.

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{CommError, CommResult, RetCode},
    frame::{HEADER_LEN, MessageHeader, MessageKind},
};

/// Upper bound on a reassembled message payload (64 MiB).
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
struct PendingChunks {
    kind: MessageKind,
    data: BytesMut,
}

/// Accumulates transport bytes and emits message boundaries.
#[derive(Debug)]
pub struct RxBuffer {
    buf: BytesMut,
    window: usize,
    window_open: bool,
    pending: Option<PendingChunks>,
}

impl RxBuffer {
    /// Create a buffer whose receive window is `window` bytes.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            window,
            window_open: false,
            pending: None,
        }
    }

    /// Expose a writable window for the transport to read into.
    ///
    /// Must be balanced by [`RxBuffer::commit_rx`] before parsing resumes.
    pub fn rx_window(&mut self) -> &mut [u8] {
        debug_assert!(!self.window_open, "window already open");
        let filled = self.buf.len();
        self.buf.resize(filled + self.window, 0);
        self.window_open = true;
        &mut self.buf[filled..]
    }

    /// Mark `n` bytes of the open window as valid.
    pub fn commit_rx(&mut self, n: usize) {
        debug_assert!(self.window_open, "commit without window");
        debug_assert!(n <= self.window);
        let filled = self.buf.len() - self.window;
        self.buf.truncate(filled + n);
        self.window_open = false;
    }

    /// Parse the next complete message, if one is buffered.
    ///
    /// Continuation chunks are joined transparently; the returned payload is
    /// the full preamble-plus-body of one message.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::ProtocolViolation`] on malformed headers, chunk
    /// sequencing violations, or a reassembled payload past the size guard.
    pub fn next_message(&mut self) -> CommResult<Option<(MessageKind, Bytes)>> {
        debug_assert!(!self.window_open, "parse during open window");
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = MessageHeader::decode(&self.buf[..HEADER_LEN])?;
            let body_len = header.body_len as usize;
            if self.buf.len() < HEADER_LEN + body_len {
                return Ok(None);
            }

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(body_len);

            match (header.is_continuation(), header.has_more()) {
                (false, false) => {
                    if self.pending.is_some() {
                        self.pending = None;
                        return Err(chunk_violation("chunk run interrupted by a whole frame"));
                    }
                    return Ok(Some((header.kind, payload.freeze())));
                }
                (false, true) => {
                    if self.pending.is_some() {
                        self.pending = None;
                        return Err(chunk_violation("nested chunk run"));
                    }
                    self.pending = Some(PendingChunks {
                        kind: header.kind,
                        data: payload,
                    });
                }
                (true, more) => {
                    let Some(pending) = self.pending.as_mut() else {
                        return Err(chunk_violation("continuation without a first chunk"));
                    };
                    if pending.kind != header.kind {
                        self.pending = None;
                        return Err(chunk_violation("chunk kind changed mid-run"));
                    }
                    if pending.data.len() + payload.len() > MAX_MESSAGE_BYTES {
                        self.pending = None;
                        return Err(CommError::new(
                            RetCode::ProtocolViolation,
                            "reassembled message exceeds size limit",
                        ));
                    }
                    pending.data.extend_from_slice(&payload);
                    if !more {
                        let done = self.pending.take().expect("pending chunk run");
                        return Ok(Some((done.kind, done.data.freeze())));
                    }
                }
            }
        }
    }

    /// Bytes buffered but not yet parsed.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buf.len() }
}

fn chunk_violation(context: &str) -> CommError {
    CommError::new(RetCode::ProtocolViolation, format!("chunking: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FLAG_CHUNK_CONT, FLAG_CHUNK_MORE};

    fn feed(rx: &mut RxBuffer, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            let window = rx.rx_window();
            let take = window.len().min(bytes.len() - offset);
            window[..take].copy_from_slice(&bytes[offset..offset + take]);
            rx.commit_rx(take);
            offset += take;
        }
    }

    fn frame(kind: MessageKind, flags: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        MessageHeader::new(body.len() as u32, kind, flags).encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn whole_frame_parses_in_one_pass() {
        let mut rx = RxBuffer::new(64);
        feed(&mut rx, &frame(MessageKind::Message, 0, b"hello"));
        let (kind, payload) = rx.next_message().expect("parse").expect("message");
        assert_eq!(kind, MessageKind::Message);
        assert_eq!(&payload[..], b"hello");
        assert!(rx.next_message().expect("parse").is_none());
    }

    #[test]
    fn split_delivery_joins_across_windows() {
        let mut rx = RxBuffer::new(4);
        let raw = frame(MessageKind::Response, 0, b"partial payload");
        feed(&mut rx, &raw);
        let (_, payload) = rx.next_message().expect("parse").expect("message");
        assert_eq!(&payload[..], b"partial payload");
    }

    #[test]
    fn chunked_message_is_reassembled() {
        let mut rx = RxBuffer::new(64);
        let mut raw = frame(MessageKind::StreamPage, FLAG_CHUNK_MORE, b"aaaa");
        raw.extend(frame(
            MessageKind::StreamPage,
            FLAG_CHUNK_CONT | FLAG_CHUNK_MORE,
            b"bbbb",
        ));
        raw.extend(frame(MessageKind::StreamPage, FLAG_CHUNK_CONT, b"cc"));
        feed(&mut rx, &raw);
        let (kind, payload) = rx.next_message().expect("parse").expect("message");
        assert_eq!(kind, MessageKind::StreamPage);
        assert_eq!(&payload[..], b"aaaabbbbcc");
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut rx = RxBuffer::new(64);
        feed(&mut rx, &frame(MessageKind::Message, FLAG_CHUNK_CONT, b"x"));
        let err = rx.next_message().expect_err("must fail");
        assert_eq!(err.code, RetCode::ProtocolViolation);
    }

    #[test]
    fn interleaved_whole_frame_breaks_the_run() {
        let mut rx = RxBuffer::new(64);
        let mut raw = frame(MessageKind::Message, FLAG_CHUNK_MORE, b"first");
        raw.extend(frame(MessageKind::Message, 0, b"interloper"));
        feed(&mut rx, &raw);
        let err = rx.next_message().expect_err("must fail");
        assert_eq!(err.code, RetCode::ProtocolViolation);
    }

    #[test]
    fn several_messages_per_window_all_surface() {
        let mut rx = RxBuffer::new(256);
        let mut raw = frame(MessageKind::Message, 0, b"one");
        raw.extend(frame(MessageKind::Message, 0, b"two"));
        raw.extend(frame(MessageKind::Message, 0, b"three"));
        feed(&mut rx, &raw);
        let mut seen = Vec::new();
        while let Some((_, payload)) = rx.next_message().expect("parse") {
            seen.push(payload);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(&seen[2][..], b"three");
        assert_eq!(rx.buffered(), 0);
    }
}
