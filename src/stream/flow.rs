//! Sender-side window state for one direction of a stream call.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::warn;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CommError, CommResult, RetCode},
    message::{CallId, ProtocolMessage},
    pipeline::TxPipeline,
};

/// Lifecycle of the sending direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlowPhase {
    /// Open request not yet confirmed sent; pages must not overtake it.
    Created,
    /// Pages may flow, subject to credit.
    Allowed,
    /// Completion message is being flushed.
    Completing,
    /// Terminal; writes fail.
    Closed,
}

#[derive(Debug)]
struct FlowState {
    credit: u32,
    next_seq: u64,
    phase: FlowPhase,
    error: Option<CommError>,
}

/// Credit-gated page sender.
///
/// `send_page` callers queue FIFO behind an async gate; the credit wait
/// itself releases the state mutex, so acks arriving on the receive task
/// always get through.
#[derive(Debug)]
pub(crate) struct PageFlow {
    pipeline: Arc<TxPipeline>,
    call_id: CallId,
    window: u32,
    state: Mutex<FlowState>,
    wake: Notify,
    send_gate: tokio::sync::Mutex<()>,
}

impl PageFlow {
    pub(crate) fn new(pipeline: Arc<TxPipeline>, call_id: CallId, window: u32) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            call_id,
            window,
            state: Mutex::new(FlowState {
                credit: window,
                next_seq: 0,
                phase: FlowPhase::Created,
                error: None,
            }),
            wake: Notify::new(),
            send_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Unblock page sending once the opening request is confirmed sent.
    pub(crate) fn allow(&self) {
        let mut state = self.state.lock().expect("flow state poisoned");
        if state.phase == FlowPhase::Created {
            state.phase = FlowPhase::Allowed;
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Restore one page of credit.
    pub(crate) fn on_ack(&self, seq: u64) {
        let mut state = self.state.lock().expect("flow state poisoned");
        if state.credit >= self.window {
            warn!(
                "stream {}: ack for page {seq} exceeds the window; ignored",
                self.call_id
            );
            return;
        }
        state.credit += 1;
        drop(state);
        self.wake.notify_one();
    }

    /// Terminal failure; pending and future writes observe `error`.
    pub(crate) fn fail(&self, error: CommError) {
        let mut state = self.state.lock().expect("flow state poisoned");
        if state.phase != FlowPhase::Closed {
            state.phase = FlowPhase::Closed;
            state.error = Some(error);
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Ship one page, consuming a credit; suspends while credit is exhausted.
    pub(crate) async fn send_page(
        &self,
        body: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<()> {
        let _gate = self.send_gate.lock().await;
        let seq = self.reserve_credit(cancel).await?;
        self.pipeline
            .send(&ProtocolMessage::StreamPage {
                call_id: self.call_id.clone(),
                seq,
                body,
            })
            .await
    }

    /// Flush the terminal completion marker.
    pub(crate) async fn complete(&self, error: Option<CommError>) -> CommResult<()> {
        let _gate = self.send_gate.lock().await;
        {
            let mut state = self.state.lock().expect("flow state poisoned");
            match state.phase {
                FlowPhase::Closed => {
                    return Err(state
                        .error
                        .clone()
                        .unwrap_or_else(|| CommError::code(RetCode::StreamCompleted)));
                }
                FlowPhase::Completing => return Err(CommError::code(RetCode::StreamCompleted)),
                FlowPhase::Created | FlowPhase::Allowed => state.phase = FlowPhase::Completing,
            }
        }
        let result = self
            .pipeline
            .send(&ProtocolMessage::StreamCompletion {
                call_id: self.call_id.clone(),
                error,
            })
            .await;
        let mut state = self.state.lock().expect("flow state poisoned");
        state.phase = FlowPhase::Closed;
        drop(state);
        self.wake.notify_one();
        result
    }

    async fn reserve_credit(&self, cancel: Option<&CancellationToken>) -> CommResult<u64> {
        loop {
            let wait = self.wake.notified();
            {
                let mut state = self.state.lock().expect("flow state poisoned");
                match state.phase {
                    FlowPhase::Created => {}
                    FlowPhase::Allowed => {
                        if state.credit > 0 {
                            state.credit -= 1;
                            let seq = state.next_seq;
                            state.next_seq += 1;
                            return Ok(seq);
                        }
                    }
                    FlowPhase::Completing | FlowPhase::Closed => {
                        return Err(state
                            .error
                            .clone()
                            .unwrap_or_else(|| CommError::code(RetCode::StreamCompleted)));
                    }
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

    #[cfg(test)]
    pub(crate) fn credit(&self) -> u32 { self.state.lock().expect("flow state poisoned").credit }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::buffer::{SegmentPool, TxBuffer};

    fn flow(window: u32) -> Arc<PageFlow> {
        let pool = Arc::new(SegmentPool::new(4096, 8));
        let pipeline = TxPipeline::new(Arc::new(TxBuffer::new(pool)));
        PageFlow::new(pipeline, CallId::new("t/1"), window)
    }

    #[tokio::test]
    async fn pages_wait_for_allow() {
        let flow = flow(2);
        let sender = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.send_page(Bytes::from_static(b"p"), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished(), "page must not precede the opener");
        flow.allow();
        sender.await.expect("join").expect("send");
    }

    #[tokio::test]
    async fn credit_exhaustion_suspends_until_ack() {
        let flow = flow(1);
        flow.allow();
        flow.send_page(Bytes::from_static(b"a"), None).await.expect("first page");
        assert_eq!(flow.credit(), 0);

        let blocked = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.send_page(Bytes::from_static(b"b"), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "no credit, writer must suspend");

        flow.on_ack(0);
        blocked.await.expect("join").expect("send");
        assert_eq!(flow.credit(), 0);
    }

    #[tokio::test]
    async fn cancellation_wakes_a_suspended_writer() {
        let flow = flow(1);
        flow.allow();
        flow.send_page(Bytes::from_static(b"a"), None).await.expect("first page");

        let token = CancellationToken::new();
        let blocked = {
            let flow = Arc::clone(&flow);
            let token = token.clone();
            tokio::spawn(async move { flow.send_page(Bytes::from_static(b"b"), Some(&token)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = blocked.await.expect("join").expect_err("cancelled");
        assert_eq!(err.code, RetCode::OperationCanceled);

        // State stays coherent: an ack later still restores credit.
        flow.on_ack(0);
        flow.send_page(Bytes::from_static(b"c"), None).await.expect("resume");
    }

    #[tokio::test]
    async fn writes_after_completion_fail() {
        let flow = flow(1);
        flow.allow();
        flow.complete(None).await.expect("complete");
        let err = flow
            .send_page(Bytes::from_static(b"late"), None)
            .await
            .expect_err("must fail");
        assert_eq!(err.code, RetCode::StreamCompleted);
    }
}
