//! Stream call objects and their dispatcher operation.
//!
//! All stream call shapes (input-only, output-only, duplex, with or without
//! a typed return) are one struct whose accessors reflect the direction
//! flags chosen at open time: an absent writer means no input direction, an
//! absent reader no output direction. The completion handle resolves with
//! the call's response body, or with the channel fault.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    dispatch::Operation,
    error::{CommError, CommResult, RetCode},
    message::{CallId, ProtocolMessage},
    serializer::{DecodeWith, Serializer},
    stream::{
        flow::PageFlow,
        queue::PageQueue,
        reader::{ByteStreamReader, StreamReader},
        writer::{ByteStreamWriter, StreamWriter},
    },
};

/// Future-like handle resolving with the call's final response body.
pub struct CompletionHandle {
    rx: oneshot::Receiver<CommResult<Bytes>>,
}

impl CompletionHandle {
    pub(crate) fn pair() -> (oneshot::Sender<CommResult<Bytes>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Await the raw response body.
    ///
    /// # Errors
    ///
    /// Returns the fault the call failed with, or
    /// [`RetCode::ChannelClosed`] when the channel went away without one.
    pub async fn wait(self) -> CommResult<Bytes> {
        self.rx
            .await
            .map_err(|_| CommError::code(RetCode::ChannelClosed))?
    }

    /// Await the response decoded as `Ret`.
    ///
    /// # Errors
    ///
    /// Propagates [`CompletionHandle::wait`] failures and decode errors.
    pub async fn wait_typed<Ret, S>(self, serializer: &S) -> CommResult<Ret>
    where
        S: Serializer,
        Ret: DecodeWith<S>,
    {
        let body = self.wait().await?;
        serializer.deserialize(&body)
    }
}

/// A typed stream call: optional input writer, optional output reader, and
/// the completion handle.
pub struct StreamCall<In, Out, S> {
    input: Option<StreamWriter<In, S>>,
    output: Option<StreamReader<Out, S>>,
    completion: CompletionHandle,
}

impl<In, Out, S> StreamCall<In, Out, S> {
    pub(crate) fn new(
        input: Option<StreamWriter<In, S>>,
        output: Option<StreamReader<Out, S>>,
        completion: CompletionHandle,
    ) -> Self {
        Self {
            input,
            output,
            completion,
        }
    }

    /// Input writer, present when the call was opened with an input
    /// direction.
    #[must_use]
    pub fn input(&self) -> Option<&StreamWriter<In, S>> { self.input.as_ref() }

    /// Output reader, present when the call was opened with an output
    /// direction.
    #[must_use]
    pub fn output(&self) -> Option<&StreamReader<Out, S>> { self.output.as_ref() }

    /// Split the call into its moving parts.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Option<StreamWriter<In, S>>,
        Option<StreamReader<Out, S>>,
        CompletionHandle,
    ) {
        (self.input, self.output, self.completion)
    }
}

/// A byte stream call; directions mirror [`StreamCall`].
pub struct ByteStreamCall {
    input: Option<ByteStreamWriter>,
    output: Option<ByteStreamReader>,
    completion: CompletionHandle,
}

impl ByteStreamCall {
    pub(crate) fn new(
        input: Option<ByteStreamWriter>,
        output: Option<ByteStreamReader>,
        completion: CompletionHandle,
    ) -> Self {
        Self {
            input,
            output,
            completion,
        }
    }

    /// Input writer, when the call has an input direction.
    #[must_use]
    pub fn input(&self) -> Option<&ByteStreamWriter> { self.input.as_ref() }

    /// Output reader, when the call has an output direction.
    #[must_use]
    pub fn output(&self) -> Option<&ByteStreamReader> { self.output.as_ref() }

    /// Split the call into its moving parts.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Option<ByteStreamWriter>,
        Option<ByteStreamReader>,
        CompletionHandle,
    ) {
        (self.input, self.output, self.completion)
    }
}

/// Dispatcher operation backing a stream call on either side.
pub(crate) struct StreamOperation {
    call_id: CallId,
    flow: Option<Arc<PageFlow>>,
    queue: Option<Arc<PageQueue>>,
    completion: Option<oneshot::Sender<CommResult<Bytes>>>,
}

impl StreamOperation {
    pub(crate) fn new(
        call_id: CallId,
        flow: Option<Arc<PageFlow>>,
        queue: Option<Arc<PageQueue>>,
        completion: Option<oneshot::Sender<CommResult<Bytes>>>,
    ) -> Self {
        Self {
            call_id,
            flow,
            queue,
            completion,
        }
    }
}

impl Operation for StreamOperation {
    fn complete(mut self: Box<Self>, body: Bytes) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(body));
        }
        // The response is terminal for the whole call: readers drain what is
        // buffered and stop, late writes fail.
        if let Some(queue) = &self.queue {
            queue.set_complete(None);
        }
        if let Some(flow) = &self.flow {
            flow.fail(CommError::code(RetCode::StreamCompleted));
        }
    }

    fn fail(mut self: Box<Self>, error: CommError) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(queue) = &self.queue {
            queue.set_complete(Some(error.clone()));
        }
        if let Some(flow) = &self.flow {
            flow.fail(error);
        }
    }

    fn update(&self, msg: ProtocolMessage) -> CommResult<()> {
        match msg {
            ProtocolMessage::StreamPage { seq, body, .. } => match &self.queue {
                Some(queue) => queue.push_page(seq, body),
                None => Err(no_direction(&self.call_id, "page", "output")),
            },
            ProtocolMessage::StreamAck { seq, .. } => match &self.flow {
                Some(flow) => {
                    flow.on_ack(seq);
                    Ok(())
                }
                None => Err(no_direction(&self.call_id, "ack", "input")),
            },
            ProtocolMessage::StreamCompletion { error, .. } => match &self.queue {
                Some(queue) => {
                    queue.set_complete(error);
                    Ok(())
                }
                None => Err(no_direction(&self.call_id, "completion", "output")),
            },
            other => Err(CommError::new(
                RetCode::UnexpectedMessage,
                format!("{:?} routed to stream call {}", other.kind(), self.call_id),
            )),
        }
    }
}

fn no_direction(call_id: &CallId, what: &str, direction: &str) -> CommError {
    CommError::new(
        RetCode::UnexpectedMessage,
        format!("stream {call_id}: {what} received but the call has no {direction} direction"),
    )
}
