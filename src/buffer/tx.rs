//! Outbound message buffer.
//!
//! `TxBuffer` sits between the serialization layer and the transport drain
//! loop. Writers frame one message at a time into the current segment;
//! completed segments queue up for the drain side, which awaits them via
//! [`TxBuffer::dequeue`]. A message that outgrows one segment is split into
//! continuation chunks, each with its own header, so the drain loop can ship
//! the early chunks while the tail is still being encoded.
//!
//! All shared state sits behind a single mutex held only for queue rotation
//! and header patching; payload bytes are copied into a segment the writer
//! has checked out, with no lock held.

use std::{collections::VecDeque, mem, sync::Arc};

use tokio::sync::Notify;

use crate::{
    buffer::{Segment, SegmentPool},
    error::{CommError, CommResult, RetCode},
    frame::{FLAG_CHUNK_CONT, FLAG_CHUNK_MORE, HEADER_LEN, MessageHeader, MessageKind},
};

#[derive(Debug)]
struct TxState {
    /// Segment accepting the next message; `None` while a writer has it
    /// checked out or until first use.
    current: Option<Segment>,
    /// Completed segments awaiting drain.
    queue: VecDeque<Segment>,
    /// A message is being written; the drain side must not steal `current`.
    locked: bool,
    closed: bool,
}

/// Mutex-guarded segment queue with an awaitable drain side.
#[derive(Debug)]
pub struct TxBuffer {
    state: std::sync::Mutex<TxState>,
    readable: Notify,
    pool: Arc<SegmentPool>,
}

impl TxBuffer {
    /// Create a buffer drawing segments from `pool`.
    #[must_use]
    pub fn new(pool: Arc<SegmentPool>) -> Self {
        Self {
            state: std::sync::Mutex::new(TxState {
                current: None,
                queue: VecDeque::new(),
                locked: false,
                closed: false,
            }),
            readable: Notify::new(),
            pool,
        }
    }

    /// Largest payload that fits a single frame in one segment.
    #[must_use]
    pub fn usable_size(&self) -> usize { self.pool.segment_size() - HEADER_LEN }

    /// Begin framing a message of the given kind.
    ///
    /// Marks the buffer locked so the drain side cannot release a
    /// half-written segment. The returned writer must be finished with
    /// [`MessageWriter::end_message`]; dropping it abandons the message.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::InvalidChannelState`] when the buffer is closed or
    /// another message is still being written.
    pub fn start_message(&self, kind: MessageKind) -> CommResult<MessageWriter<'_>> {
        let mut segment = {
            let mut state = self.state.lock().expect("tx buffer poisoned");
            if state.closed {
                return Err(CommError::new(RetCode::InvalidChannelState, "tx buffer closed"));
            }
            if state.locked {
                return Err(CommError::new(
                    RetCode::InvalidChannelState,
                    "concurrent message write",
                ));
            }
            state.locked = true;
            state.current.take()
        }
        .unwrap_or_else(|| self.pool.acquire());

        // Rotate upfront when not even a header fits the remaining space.
        if self.pool.segment_size().saturating_sub(segment.len()) < HEADER_LEN {
            self.enqueue(segment);
            segment = self.pool.acquire();
        }

        let mut writer = MessageWriter {
            buffer: self,
            segment,
            kind,
            header_at: 0,
            continuation: false,
            alloc: None,
            finished: false,
        };
        writer.open_chunk();
        Ok(writer)
    }

    /// Wait for the next ready segment.
    ///
    /// Completes synchronously when data is already queued; otherwise
    /// resolves when a writer finishes (or chunks out) a message. When only
    /// the current segment holds unlocked data it is sealed and handed out.
    /// Returns `None` once the buffer is closed and fully drained.
    pub async fn dequeue(&self) -> Option<Segment> {
        loop {
            {
                let mut state = self.state.lock().expect("tx buffer poisoned");
                if let Some(segment) = state.queue.pop_front() {
                    return Some(segment);
                }
                if !state.locked
                    && state.current.as_ref().is_some_and(|seg| !seg.is_empty())
                {
                    return state.current.take();
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the buffer; pending dequeues resolve once residual data drains.
    pub fn close(&self) {
        self.state.lock().expect("tx buffer poisoned").closed = true;
        self.readable.notify_one();
    }

    /// Committed bytes awaiting drain: queued segments plus the committed
    /// portion of the current segment.
    #[must_use]
    pub fn data_size(&self) -> usize {
        let state = self.state.lock().expect("tx buffer poisoned");
        let queued: usize = state.queue.iter().map(Segment::len).sum();
        queued + state.current.as_ref().map_or(0, Segment::len)
    }

    fn enqueue(&self, segment: Segment) {
        if segment.is_empty() {
            self.pool.release(segment);
            return;
        }
        self.state
            .lock()
            .expect("tx buffer poisoned")
            .queue
            .push_back(segment);
        self.readable.notify_one();
    }

    fn finish_message(&self, segment: Segment) {
        let mut state = self.state.lock().expect("tx buffer poisoned");
        debug_assert!(state.locked);
        debug_assert!(state.current.is_none());
        state.current = Some(segment);
        state.locked = false;
        drop(state);
        self.readable.notify_one();
    }
}

#[derive(Debug)]
enum Alloc {
    /// Span carved directly out of the current segment.
    Direct { start: usize, len: usize },
    /// Oversized payload staged in the extra-large scratch buffer.
    Xl(Vec<u8>),
}

/// In-progress message framing handle.
///
/// The writer owns the checked-out segment; `allocate`/`advance`/`write`
/// never touch the buffer mutex. Chunk rotation and header patching lock it
/// briefly.
#[derive(Debug)]
pub struct MessageWriter<'a> {
    buffer: &'a TxBuffer,
    segment: Segment,
    kind: MessageKind,
    header_at: usize,
    continuation: bool,
    alloc: Option<Alloc>,
    finished: bool,
}

impl MessageWriter<'_> {
    fn open_chunk(&mut self) {
        self.header_at = self.segment.len();
        let len = self.segment.len();
        self.segment.buf_mut().resize(len + HEADER_LEN, 0);
    }

    fn remaining(&self) -> usize {
        self.buffer
            .pool
            .segment_size()
            .saturating_sub(self.segment.len())
    }

    fn chunk_body_len(&self) -> usize { self.segment.len() - self.header_at - HEADER_LEN }

    fn patch_header(&mut self, more: bool) {
        let mut flags = 0;
        if self.continuation {
            flags |= FLAG_CHUNK_CONT;
        }
        if more {
            flags |= FLAG_CHUNK_MORE;
        }
        let header = MessageHeader::new(self.chunk_body_len() as u32, self.kind, flags);
        let at = self.header_at;
        header.encode(&mut self.segment.buf_mut()[at..at + HEADER_LEN]);
    }

    /// Seal the current chunk and continue the message in a fresh segment.
    fn rotate_chunk(&mut self) {
        if self.chunk_body_len() == 0 {
            // Nothing written into this chunk yet; move the reserved header
            // to the fresh segment instead of emitting an empty chunk.
            let at = self.header_at;
            self.segment.buf_mut().truncate(at);
            let old = mem::replace(&mut self.segment, self.buffer.pool.acquire());
            self.buffer.enqueue(old);
        } else {
            self.patch_header(true);
            let old = mem::replace(&mut self.segment, self.buffer.pool.acquire());
            self.buffer.enqueue(old);
            self.continuation = true;
        }
        self.open_chunk();
    }

    /// Reserve a contiguous writable span of `size_hint` bytes.
    ///
    /// Spans up to the usable segment size come straight from the current
    /// segment, rotating to a continuation chunk when the remainder is too
    /// small. Larger hints are staged in an extra-large scratch buffer that
    /// [`MessageWriter::advance`] splits across segments on commit.
    pub fn allocate(&mut self, size_hint: usize) -> &mut [u8] {
        debug_assert!(self.alloc.is_none(), "previous allocation not advanced");
        if size_hint > self.buffer.usable_size() {
            self.alloc = Some(Alloc::Xl(vec![0; size_hint]));
            match self.alloc.as_mut() {
                Some(Alloc::Xl(xl)) => return xl.as_mut_slice(),
                _ => unreachable!(),
            }
        }
        if size_hint > self.remaining() {
            self.rotate_chunk();
        }
        let start = self.segment.len();
        self.segment.buf_mut().resize(start + size_hint, 0);
        self.alloc = Some(Alloc::Direct {
            start,
            len: size_hint,
        });
        &mut self.segment.buf_mut()[start..start + size_hint]
    }

    /// Commit `n` bytes from the last allocation.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the allocated span or no allocation is
    /// outstanding.
    pub fn advance(&mut self, n: usize) {
        match self.alloc.take() {
            Some(Alloc::Direct { start, len }) => {
                assert!(n <= len, "advance past allocation");
                self.segment.buf_mut().truncate(start + n);
            }
            Some(Alloc::Xl(xl)) => {
                assert!(n <= xl.len(), "advance past allocation");
                self.copy_in(&xl[..n]);
            }
            None => panic!("advance without allocation"),
        }
    }

    /// Append `bytes` to the message, rotating chunks as segments fill.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(self.alloc.is_none(), "write during outstanding allocation");
        self.copy_in(bytes);
    }

    fn copy_in(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let space = self.remaining();
            if space == 0 {
                self.rotate_chunk();
                continue;
            }
            let take = space.min(bytes.len());
            self.segment.buf_mut().extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Patch the final header, release the buffer lock, and wake the drain
    /// side.
    pub fn end_message(mut self) {
        debug_assert!(self.alloc.is_none(), "allocation not advanced");
        self.patch_header(false);
        self.finished = true;
        let segment = mem::replace(&mut self.segment, Segment::detached());
        self.buffer.finish_message(segment);
    }
}

impl Drop for MessageWriter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned message: drop the partial chunk and unlock the buffer.
        // Chunks already sealed cannot be recalled; the pipeline faults the
        // channel on encode failures, so the wire never sees the torn tail.
        let at = self.header_at;
        self.segment.buf_mut().truncate(at);
        let segment = mem::replace(&mut self.segment, Segment::detached());
        self.buffer.finish_message(segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_CHUNK_BODY;

    fn buffer(segment_size: usize) -> TxBuffer {
        TxBuffer::new(Arc::new(SegmentPool::new(segment_size, 8)))
    }

    fn drain_now(buf: &TxBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let state_empty = buf.data_size() == 0;
            if state_empty {
                break;
            }
            let seg = futures::executor::block_on(buf.dequeue()).expect("segment");
            out.extend_from_slice(seg.as_slice());
        }
        out
    }

    fn parse_frames(mut raw: &[u8]) -> Vec<(MessageKind, u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while !raw.is_empty() {
            let header = MessageHeader::decode(raw).expect("header");
            let body = &raw[HEADER_LEN..HEADER_LEN + header.body_len as usize];
            frames.push((header.kind, header.flags, body.to_vec()));
            raw = &raw[HEADER_LEN + header.body_len as usize..];
        }
        frames
    }

    #[test]
    fn small_messages_share_a_segment() {
        let buf = buffer(256);
        for payload in [b"one".as_ref(), b"two".as_ref(), b"three".as_ref()] {
            let mut writer = buf.start_message(MessageKind::Message).expect("start");
            writer.write(payload);
            writer.end_message();
        }
        assert_eq!(buf.data_size(), 3 * HEADER_LEN + 3 + 3 + 5);

        let raw = drain_now(&buf);
        let frames = parse_frames(&raw);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].2, b"one");
        assert_eq!(frames[2].2, b"three");
        assert!(frames.iter().all(|(_, flags, _)| *flags == 0));
    }

    #[test]
    fn payload_filling_usable_size_stays_unchunked() {
        let buf = buffer(128);
        let payload = vec![0x5A; 128 - HEADER_LEN];
        let mut writer = buf.start_message(MessageKind::Message).expect("start");
        let span = writer.allocate(payload.len());
        span.copy_from_slice(&payload);
        writer.advance(payload.len());
        writer.end_message();

        let frames = parse_frames(&drain_now(&buf));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 0);
        assert_eq!(frames[0].2, payload);
    }

    #[test]
    fn one_byte_past_usable_size_takes_the_xl_path() {
        let buf = buffer(128);
        let payload: Vec<u8> = (0..(128 - HEADER_LEN + 1)).map(|i| i as u8).collect();
        let mut writer = buf.start_message(MessageKind::Message).expect("start");
        let span = writer.allocate(payload.len());
        assert_eq!(span.len(), payload.len(), "xl span must be contiguous");
        span.copy_from_slice(&payload);
        writer.advance(payload.len());
        writer.end_message();

        let frames = parse_frames(&drain_now(&buf));
        assert!(frames.len() > 1, "must chunk across segments");
        assert_eq!(frames[0].1, FLAG_CHUNK_MORE);
        let last = frames.last().expect("last frame");
        assert_eq!(last.1, FLAG_CHUNK_CONT);
        let joined: Vec<u8> = frames.iter().flat_map(|(_, _, b)| b.clone()).collect();
        assert_eq!(joined, payload);
        assert!(frames.iter().all(|(_, _, b)| b.len() <= MAX_CHUNK_BODY));
    }

    #[test]
    fn incremental_writes_chunk_mid_message() {
        let buf = buffer(64);
        let mut writer = buf.start_message(MessageKind::StreamPage).expect("start");
        for _ in 0..10 {
            writer.write(&[0xAB; 16]);
        }
        writer.end_message();

        let frames = parse_frames(&drain_now(&buf));
        let joined: Vec<u8> = frames.iter().flat_map(|(_, _, b)| b.clone()).collect();
        assert_eq!(joined, vec![0xAB; 160]);
        assert!(frames[..frames.len() - 1]
            .iter()
            .all(|(_, flags, _)| flags & FLAG_CHUNK_MORE != 0));
    }

    #[tokio::test]
    async fn dequeue_waits_for_end_of_message() {
        let buf = Arc::new(buffer(256));
        let drain = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.dequeue().await })
        };
        tokio::task::yield_now().await;

        let mut writer = buf.start_message(MessageKind::Message).expect("start");
        writer.write(b"late");
        writer.end_message();

        let seg = drain.await.expect("join").expect("segment");
        let frames = parse_frames(seg.as_slice());
        assert_eq!(frames[0].2, b"late");
    }

    #[tokio::test]
    async fn close_resolves_pending_dequeue_with_sentinel() {
        let buf = Arc::new(buffer(256));
        let drain = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.dequeue().await })
        };
        tokio::task::yield_now().await;
        buf.close();
        assert!(drain.await.expect("join").is_none());
        assert!(buf.start_message(MessageKind::Message).is_err());
    }

    #[test]
    fn abandoned_writer_unlocks_the_buffer() {
        let buf = buffer(256);
        {
            let mut writer = buf.start_message(MessageKind::Message).expect("start");
            writer.write(b"doomed");
        }
        assert_eq!(buf.data_size(), 0);
        let mut writer = buf.start_message(MessageKind::Message).expect("restart");
        writer.write(b"ok");
        writer.end_message();
        assert_eq!(buf.data_size(), HEADER_LEN + 2);
    }
}
