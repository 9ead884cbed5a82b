//! Receiver-side page queue for one direction of a stream call.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CommError, CommResult, RetCode},
    message::{CallId, ProtocolMessage},
    pipeline::TxPipeline,
};

#[derive(Debug)]
struct QueueState {
    pages: VecDeque<(u64, Bytes)>,
    expected_seq: u64,
    terminal: Option<Option<CommError>>,
}

/// Ordered queue of received pages.
///
/// Pages are pushed by the dispatcher in arrival order and leased out to
/// readers; releasing a lease emits the [`ProtocolMessage::StreamAck`] that
/// restores the writer's credit, so memory stays bounded by the window.
#[derive(Debug)]
pub(crate) struct PageQueue {
    pipeline: Arc<TxPipeline>,
    call_id: CallId,
    state: Mutex<QueueState>,
    avail: Notify,
}

impl PageQueue {
    pub(crate) fn new(pipeline: Arc<TxPipeline>, call_id: CallId) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            call_id,
            state: Mutex::new(QueueState {
                pages: VecDeque::new(),
                expected_seq: 0,
                terminal: None,
            }),
            avail: Notify::new(),
        })
    }

    /// Accept one page from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::ProtocolViolation`] on a sequence gap and
    /// [`RetCode::UnexpectedMessage`] for pages after completion; the caller
    /// logs and discards, the stream itself is not corrupted.
    pub(crate) fn push_page(&self, seq: u64, body: Bytes) -> CommResult<()> {
        let mut state = self.state.lock().expect("page queue poisoned");
        if state.terminal.is_some() {
            return Err(CommError::new(
                RetCode::UnexpectedMessage,
                format!("page {seq} after stream completion"),
            ));
        }
        if seq != state.expected_seq {
            return Err(CommError::new(
                RetCode::ProtocolViolation,
                format!("page sequence gap: expected {}, got {seq}", state.expected_seq),
            ));
        }
        state.expected_seq += 1;
        state.pages.push_back((seq, body));
        drop(state);
        self.avail.notify_one();
        Ok(())
    }

    /// Record the terminal marker; readers drain buffered pages, then stop.
    pub(crate) fn set_complete(&self, error: Option<CommError>) {
        let mut state = self.state.lock().expect("page queue poisoned");
        if state.terminal.is_none() {
            state.terminal = Some(error);
        }
        drop(state);
        self.avail.notify_one();
    }

    /// Wait for the next page; `None` signals a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's fault once buffered pages are drained, or
    /// [`RetCode::OperationCanceled`] when `cancel` fires first.
    pub(crate) async fn next_page(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<Option<PageLease>> {
        loop {
            let wait = self.avail.notified();
            {
                let mut state = self.state.lock().expect("page queue poisoned");
                if let Some((seq, data)) = state.pages.pop_front() {
                    return Ok(Some(PageLease {
                        queue: Arc::clone(self),
                        seq,
                        data,
                    }));
                }
                match &state.terminal {
                    Some(None) => return Ok(None),
                    Some(Some(error)) => return Err(error.clone()),
                    None => {}
                }
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            return Err(CommError::code(RetCode::OperationCanceled));
                        }
                        () = wait => {}
                    }
                }
                None => wait.await,
            }
        }
    }

    async fn ack(&self, seq: u64) {
        let result = self
            .pipeline
            .send(&ProtocolMessage::StreamAck {
                call_id: self.call_id.clone(),
                seq,
            })
            .await;
        match result {
            Ok(()) => debug!("stream {}: acked page {seq}", self.call_id),
            // The channel is tearing down; the writer is failed separately.
            Err(error) => warn!(
                "stream {}: could not ack page {seq}: {error}",
                self.call_id
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_pages(&self) -> usize {
        self.state.lock().expect("page queue poisoned").pages.len()
    }
}

/// One received page, checked out of the queue.
///
/// Releasing the lease acknowledges the page and restores one credit to the
/// sender. A lease dropped without release never acks; readers release only
/// after the page is fully consumed.
#[derive(Debug)]
pub struct PageLease {
    queue: Arc<PageQueue>,
    seq: u64,
    data: Bytes,
}

impl PageLease {
    /// Page payload.
    #[must_use]
    pub fn data(&self) -> &Bytes { &self.data }

    /// Sequence number of this page.
    #[must_use]
    pub fn seq(&self) -> u64 { self.seq }

    /// Consume the lease, acknowledging the page to the sender.
    pub async fn release(self) {
        let queue = Arc::clone(&self.queue);
        queue.ack(self.seq).await;
    }

    /// Take the payload and acknowledge in one step.
    pub async fn into_bytes(self) -> Bytes {
        let data = self.data.clone();
        self.release().await;
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{SegmentPool, TxBuffer};

    fn queue() -> Arc<PageQueue> {
        let pool = Arc::new(SegmentPool::new(4096, 8));
        let pipeline = TxPipeline::new(Arc::new(TxBuffer::new(pool)));
        PageQueue::new(pipeline, CallId::new("t/2"))
    }

    #[tokio::test]
    async fn pages_surface_in_sequence_order() {
        let queue = queue();
        queue.push_page(0, Bytes::from_static(b"a")).expect("push");
        queue.push_page(1, Bytes::from_static(b"b")).expect("push");

        let first = queue.next_page(None).await.expect("next").expect("page");
        assert_eq!(first.seq(), 0);
        assert_eq!(&first.data()[..], b"a");
        first.release().await;

        let second = queue.next_page(None).await.expect("next").expect("page");
        assert_eq!(&second.data()[..], b"b");
    }

    #[tokio::test]
    async fn sequence_gap_is_rejected_without_corrupting_state() {
        let queue = queue();
        queue.push_page(0, Bytes::from_static(b"a")).expect("push");
        let err = queue.push_page(2, Bytes::from_static(b"c")).expect_err("gap");
        assert_eq!(err.code, RetCode::ProtocolViolation);
        // The in-order successor is still accepted.
        queue.push_page(1, Bytes::from_static(b"b")).expect("push");
        assert_eq!(queue.buffered_pages(), 2);
    }

    #[tokio::test]
    async fn completion_drains_then_signals_end() {
        let queue = queue();
        queue.push_page(0, Bytes::from_static(b"tail")).expect("push");
        queue.set_complete(None);

        let page = queue.next_page(None).await.expect("next").expect("page");
        assert_eq!(&page.data()[..], b"tail");
        page.release().await;
        assert!(queue.next_page(None).await.expect("next").is_none());

        let late = queue.push_page(1, Bytes::from_static(b"x")).expect_err("late");
        assert_eq!(late.code, RetCode::UnexpectedMessage);
    }

    #[tokio::test]
    async fn fault_surfaces_after_buffered_pages() {
        let queue = queue();
        queue.push_page(0, Bytes::from_static(b"ok")).expect("push");
        queue.set_complete(Some(CommError::code(RetCode::ConnectionAbortedByPeer)));

        assert!(queue.next_page(None).await.expect("next").is_some());
        let err = queue.next_page(None).await.expect_err("fault");
        assert_eq!(err.code, RetCode::ConnectionAbortedByPeer);
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_empty_wait() {
        let queue = queue();
        let token = CancellationToken::new();
        let waiting = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            tokio::spawn(async move { queue.next_page(Some(&token)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let err = waiting.await.expect("join").expect_err("cancelled");
        assert_eq!(err.code, RetCode::OperationCanceled);
    }
}
