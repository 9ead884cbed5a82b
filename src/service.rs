//! Service-side handler surface.
//!
//! A channel hosting services installs a [`ServiceHandler`]; the dispatcher
//! invokes it for inbound requests, one-way messages, and stream calls.
//! Handlers work at the body-bytes level; typed method stubs are the
//! contract code generator's concern and sit on top of this trait.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CommError, CommResult, RetCode},
    message::CallId,
    stream::{ByteStreamReader, ByteStreamWriter},
};

/// One inbound request as seen by a handler.
pub struct InboundRequest {
    call_id: CallId,
    body: Bytes,
    cancellation: CancellationToken,
}

impl InboundRequest {
    pub(crate) fn new(call_id: CallId, body: Bytes, cancellation: CancellationToken) -> Self {
        Self {
            call_id,
            body,
            cancellation,
        }
    }

    /// Identifier of the call; echoed in the response automatically.
    #[must_use]
    pub fn call_id(&self) -> &CallId { &self.call_id }

    /// Opaque request body.
    #[must_use]
    pub fn body(&self) -> &Bytes { &self.body }

    /// Token flipped when the caller sends a cancel control message.
    ///
    /// Only armed for requests opened with the cancellable option; otherwise
    /// it never fires.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken { &self.cancellation }
}

/// One inbound stream call as seen by a handler.
///
/// Directions follow the caller's request options: `take_input` yields the
/// reader for pages the caller sends, `take_output` the writer for pages the
/// handler sends back.
pub struct InboundStreamCall {
    request: InboundRequest,
    input: Option<ByteStreamReader>,
    output: Option<ByteStreamWriter>,
}

impl InboundStreamCall {
    pub(crate) fn new(
        request: InboundRequest,
        input: Option<ByteStreamReader>,
        output: Option<ByteStreamWriter>,
    ) -> Self {
        Self {
            request,
            input,
            output,
        }
    }

    /// The opening request.
    #[must_use]
    pub fn request(&self) -> &InboundRequest { &self.request }

    /// Take the reader for the caller's pages, if the call has an input
    /// direction.
    pub fn take_input(&mut self) -> Option<ByteStreamReader> { self.input.take() }

    /// Take the writer for pages back to the caller, if the call has an
    /// output direction.
    pub fn take_output(&mut self) -> Option<ByteStreamWriter> { self.output.take() }
}

/// User-supplied service entry points.
///
/// Errors returned from `handle_request`/`handle_stream` travel back to the
/// caller as fault responses; panics are contained and surface as
/// [`RetCode::RequestCrash`].
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Serve a unary request, returning the response body.
    async fn handle_request(&self, request: InboundRequest) -> CommResult<Bytes>;

    /// Consume a one-way message. The default discards it.
    async fn handle_message(&self, body: Bytes) {
        debug!("one-way message of {} bytes ignored", body.len());
    }

    /// Serve a stream call, returning the response body sent after the
    /// handler finishes. The default refuses stream calls.
    async fn handle_stream(&self, mut call: InboundStreamCall) -> CommResult<Bytes> {
        drop(call.take_input());
        drop(call.take_output());
        Err(CommError::new(
            RetCode::UnexpectedMessage,
            "service hosts no stream calls",
        ))
    }
}
