//! Per-call operation capability.
//!
//! The dispatcher holds one boxed [`Operation`] per outstanding call. Every
//! operation can be completed or failed exactly once (both consume the box);
//! stream calls additionally accept auxiliary messages while registered.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    error::{CommError, CommResult, RetCode},
    message::ProtocolMessage,
};

/// Capability the dispatcher exercises on a registered call.
pub(crate) trait Operation: Send {
    /// Deliver the final response body; the record is already removed.
    fn complete(self: Box<Self>, body: Bytes);

    /// Fail the call; the record is already removed.
    fn fail(self: Box<Self>, error: CommError);

    /// Deliver an auxiliary message (stream page, ack, completion) while the
    /// call stays registered.
    ///
    /// # Errors
    ///
    /// The default rejects everything with [`RetCode::UnexpectedMessage`];
    /// only stream calls override it.
    fn update(&self, msg: ProtocolMessage) -> CommResult<()> {
        Err(CommError::new(
            RetCode::UnexpectedMessage,
            format!("{:?} for a unary call", msg.kind()),
        ))
    }
}

/// One-shot completion sink for a unary call.
pub(crate) struct UnaryWaiter {
    tx: oneshot::Sender<CommResult<Bytes>>,
}

impl UnaryWaiter {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<CommResult<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }
}

impl Operation for UnaryWaiter {
    fn complete(self: Box<Self>, body: Bytes) { let _ = self.tx.send(Ok(body)); }

    fn fail(self: Box<Self>, error: CommError) { let _ = self.tx.send(Err(error)); }
}
