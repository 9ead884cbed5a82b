//! Message dispatcher: call correlation and inbound routing.
//!
//! The dispatcher owns the `CallId → Operation` map. Outbound calls register
//! a waiter before the request leaves, inbound traffic is routed by call id:
//! responses and faults consume the record, stream pages/acks/completions
//! update it in place, requests and one-way messages go to the service
//! handler. Late messages for an unknown call are logged and discarded; they
//! never fault the channel.
//!
//! Two concurrency modes exist: `NoQueue` processes inbound messages inline
//! on the receive task (user handlers run there), `PagedQueueX1` feeds a
//! bounded queue drained by one worker task, preserving arrival order.

mod operation;

use std::{collections::HashMap, mem, sync::Arc};

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) use operation::{Operation, UnaryWaiter};

use crate::{
    context::ChannelContext,
    error::{CommError, CommResult, RetCode},
    message::{
        CallId, ProtocolMessage, REQUEST_CANCELLABLE, REQUEST_STREAM_IN, REQUEST_STREAM_OUT,
    },
    panic::format_panic,
    pipeline::TxPipeline,
    service::{InboundRequest, InboundStreamCall, ServiceHandler},
    stream::{
        ByteStreamReader, ByteStreamWriter, CompletionHandle, PageFlow, PageQueue, StreamOperation,
    },
};

/// Inbound processing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Process inline on the receive task; user handlers run there.
    #[default]
    NoQueue,
    /// One worker task consumes a bounded queue, preserving arrival order.
    PagedQueueX1,
}

struct OpsState {
    map: HashMap<CallId, Box<dyn Operation>>,
    accepting: bool,
    fault: Option<CommError>,
}

/// Settings the dispatcher needs beyond its collaborators.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DispatchSettings {
    pub(crate) mode: DispatchMode,
    pub(crate) queue_depth: usize,
    pub(crate) page_size: usize,
    pub(crate) window: u32,
}

/// Call correlation and routing hub of one channel.
pub(crate) struct MessageDispatcher {
    ctx: Arc<ChannelContext>,
    pipeline: Arc<TxPipeline>,
    service: Option<Arc<dyn ServiceHandler>>,
    settings: DispatchSettings,
    ops: std::sync::Mutex<OpsState>,
    inflight: std::sync::Mutex<HashMap<CallId, CancellationToken>>,
    queue_tx: std::sync::Mutex<Option<mpsc::Sender<ProtocolMessage>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageDispatcher {
    pub(crate) fn new(
        ctx: Arc<ChannelContext>,
        pipeline: Arc<TxPipeline>,
        service: Option<Arc<dyn ServiceHandler>>,
        settings: DispatchSettings,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            ctx,
            pipeline,
            service,
            settings,
            ops: std::sync::Mutex::new(OpsState {
                map: HashMap::new(),
                accepting: true,
                fault: None,
            }),
            inflight: std::sync::Mutex::new(HashMap::new()),
            queue_tx: std::sync::Mutex::new(None),
            worker: std::sync::Mutex::new(None),
        });
        if settings.mode == DispatchMode::PagedQueueX1 {
            dispatcher.spawn_worker();
        }
        dispatcher
    }

    fn spawn_worker(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(self.settings.queue_depth.max(1));
        *self.queue_tx.lock().expect("queue slot poisoned") = Some(tx);
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                dispatcher.process(msg).await;
            }
        });
        *self.worker.lock().expect("worker slot poisoned") = Some(handle);
    }

    /// Register an operation for `call_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::InvalidChannelState`] once the dispatcher stopped
    /// accepting calls and [`RetCode::ProtocolViolation`] on a duplicate id.
    pub(crate) fn register_call_object(
        &self,
        call_id: CallId,
        op: Box<dyn Operation>,
    ) -> CommResult<()> {
        let mut state = self.ops.lock().expect("ops state poisoned");
        if !state.accepting {
            let fault = state.fault.clone();
            drop(state);
            return Err(fault
                .unwrap_or_else(|| CommError::new(RetCode::InvalidChannelState, "not accepting calls")));
        }
        if state.map.contains_key(&call_id) {
            return Err(CommError::new(
                RetCode::ProtocolViolation,
                format!("duplicate call id {call_id}"),
            ));
        }
        state.map.insert(call_id, op);
        Ok(())
    }

    /// Remove a call record; idempotent, the operation is dropped silently.
    pub(crate) fn unregister_call_object(&self, call_id: &CallId) {
        self.ops
            .lock()
            .expect("ops state poisoned")
            .map
            .remove(call_id);
    }

    /// Number of outstanding call records.
    #[must_use]
    pub(crate) fn outstanding_calls(&self) -> usize {
        self.ops.lock().expect("ops state poisoned").map.len()
    }

    /// Issue a unary call and await its response body.
    pub(crate) async fn call(&self, body: Bytes, options: u8) -> CommResult<Bytes> {
        self.call_with_cancel(body, options, None).await
    }

    /// [`MessageDispatcher::call`] honouring a caller-supplied cancel token.
    ///
    /// Cancellation sends a best-effort cancel control message, removes the
    /// waiter, and resolves with [`RetCode::OperationCanceled`].
    pub(crate) async fn call_with_cancel(
        &self,
        body: Bytes,
        options: u8,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<Bytes> {
        let call_id = CallId::next_for(self.ctx.id(), self.ctx.next_call_seq());
        let (waiter, mut rx) = UnaryWaiter::pair();
        self.register_call_object(call_id.clone(), Box::new(waiter))?;

        let request = ProtocolMessage::Request {
            call_id: call_id.clone(),
            options,
            body,
        };
        if let Err(error) = self.pipeline.send(&request).await {
            self.unregister_call_object(&call_id);
            return Err(error);
        }

        match cancel {
            None => rx
                .await
                .unwrap_or_else(|_| Err(CommError::code(RetCode::ChannelClosed))),
            Some(token) => {
                tokio::select! {
                    result = &mut rx => {
                        result.unwrap_or_else(|_| Err(CommError::code(RetCode::ChannelClosed)))
                    }
                    () = token.cancelled() => {
                        self.unregister_call_object(&call_id);
                        let cancel_msg = ProtocolMessage::Cancel { call_id };
                        if let Err(error) = self.pipeline.send(&cancel_msg).await {
                            debug!("cancel control message not sent: {error}");
                        }
                        Err(CommError::code(RetCode::OperationCanceled))
                    }
                }
            }
        }
    }

    /// Open a stream call: register its operation, send the opening request,
    /// then allow pages to flow.
    ///
    /// Returns the flow (input direction), queue (output direction), and the
    /// completion handle.
    pub(crate) async fn open_stream_call(
        &self,
        body: Bytes,
        has_input: bool,
        has_output: bool,
        cancellable: bool,
    ) -> CommResult<(Option<Arc<PageFlow>>, Option<Arc<PageQueue>>, CompletionHandle)> {
        let call_id = CallId::next_for(self.ctx.id(), self.ctx.next_call_seq());
        let flow = has_input.then(|| {
            PageFlow::new(
                Arc::clone(&self.pipeline),
                call_id.clone(),
                self.settings.window,
            )
        });
        let queue =
            has_output.then(|| PageQueue::new(Arc::clone(&self.pipeline), call_id.clone()));
        let (completion_tx, completion) = CompletionHandle::pair();
        let op = StreamOperation::new(
            call_id.clone(),
            flow.clone(),
            queue.clone(),
            Some(completion_tx),
        );
        self.register_call_object(call_id.clone(), Box::new(op))?;

        let mut options = 0;
        if has_input {
            options |= REQUEST_STREAM_IN;
        }
        if has_output {
            options |= REQUEST_STREAM_OUT;
        }
        if cancellable {
            options |= REQUEST_CANCELLABLE;
        }
        let request = ProtocolMessage::Request {
            call_id: call_id.clone(),
            options,
            body,
        };
        if let Err(error) = self.pipeline.send(&request).await {
            self.unregister_call_object(&call_id);
            return Err(error);
        }
        // Transmission order is now fixed: pages cannot precede the opener.
        if let Some(flow) = &flow {
            flow.allow();
        }
        Ok((flow, queue, completion))
    }

    /// Accept one inbound message, honouring the configured mode.
    pub(crate) async fn on_message(self: &Arc<Self>, msg: ProtocolMessage) {
        let queued = self
            .queue_tx
            .lock()
            .expect("queue slot poisoned")
            .clone();
        match queued {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    debug!("channel {}: worker gone, inbound message dropped", self.ctx.id());
                }
            }
            None => self.process(msg).await,
        }
    }

    async fn process(self: &Arc<Self>, msg: ProtocolMessage) {
        match msg {
            ProtocolMessage::Response { call_id, body } => {
                match self.take_operation(&call_id) {
                    Some(op) => op.complete(body),
                    None => self.discard(&call_id, "response"),
                }
            }
            ProtocolMessage::Fault { call_id, error } => match self.take_operation(&call_id) {
                Some(op) => op.fail(error),
                None => self.discard(&call_id, "fault"),
            },
            msg @ (ProtocolMessage::StreamPage { .. }
            | ProtocolMessage::StreamAck { .. }
            | ProtocolMessage::StreamCompletion { .. }) => {
                let call_id = msg.call_id().cloned().expect("stream message without call id");
                let state = self.ops.lock().expect("ops state poisoned");
                match state.map.get(&call_id) {
                    Some(op) => {
                        if let Err(error) = op.update(msg) {
                            drop(state);
                            warn!(
                                "channel {}: stream update for {call_id} rejected: {error}",
                                self.ctx.id()
                            );
                        }
                    }
                    None => {
                        drop(state);
                        self.discard(&call_id, "stream message");
                    }
                }
            }
            ProtocolMessage::Request {
                call_id,
                options,
                body,
            } => self.serve_request(call_id, options, body).await,
            ProtocolMessage::Message { body } => self.serve_one_way(body).await,
            ProtocolMessage::Cancel { call_id } => {
                let token = self
                    .inflight
                    .lock()
                    .expect("inflight state poisoned")
                    .get(&call_id)
                    .cloned();
                match token {
                    Some(token) => token.cancel(),
                    None => self.discard(&call_id, "cancel"),
                }
            }
            other => warn!(
                "channel {}: {:?} reached the dispatcher unexpectedly",
                self.ctx.id(),
                other.kind()
            ),
        }
    }

    fn take_operation(&self, call_id: &CallId) -> Option<Box<dyn Operation>> {
        self.ops
            .lock()
            .expect("ops state poisoned")
            .map
            .remove(call_id)
    }

    fn discard(&self, call_id: &CallId, what: &str) {
        warn!(
            "channel {}: {what} for unknown call {call_id} discarded",
            self.ctx.id()
        );
    }

    async fn serve_one_way(&self, body: Bytes) {
        let Some(service) = self.service.clone() else {
            warn!("channel {}: one-way message without a service handler", self.ctx.id());
            return;
        };
        let outcome = std::panic::AssertUnwindSafe(service.handle_message(body))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            error!(
                "channel {}: {:?}: one-way handler panicked: {}",
                self.ctx.id(),
                RetCode::MessageHandlerCrash,
                format_panic(panic)
            );
        }
    }

    async fn serve_request(self: &Arc<Self>, call_id: CallId, options: u8, body: Bytes) {
        let Some(service) = self.service.clone() else {
            warn!(
                "channel {}: request {call_id} but no service is hosted",
                self.ctx.id()
            );
            self.respond(
                call_id,
                Err(CommError::new(
                    RetCode::UnexpectedMessage,
                    "no service hosted on this channel",
                )),
            )
            .await;
            return;
        };

        let cancellation = CancellationToken::new();
        if options & REQUEST_CANCELLABLE != 0 {
            self.inflight
                .lock()
                .expect("inflight state poisoned")
                .insert(call_id.clone(), cancellation.clone());
        }

        if options & (REQUEST_STREAM_IN | REQUEST_STREAM_OUT) != 0 {
            self.serve_stream_request(service, call_id, options, body, cancellation);
        } else {
            let request = InboundRequest::new(call_id.clone(), body, cancellation);
            let outcome = std::panic::AssertUnwindSafe(service.handle_request(request))
                .catch_unwind()
                .await;
            self.finish_request(call_id, outcome).await;
        }
    }

    /// Stream handlers get their own task: they await pages that arrive on
    /// the task running this dispatcher, so running them inline would
    /// deadlock in `NoQueue` mode.
    fn serve_stream_request(
        self: &Arc<Self>,
        service: Arc<dyn ServiceHandler>,
        call_id: CallId,
        options: u8,
        body: Bytes,
        cancellation: CancellationToken,
    ) {
        // The peer's input direction is our inbound page queue.
        let queue = (options & REQUEST_STREAM_IN != 0)
            .then(|| PageQueue::new(Arc::clone(&self.pipeline), call_id.clone()));
        let flow = (options & REQUEST_STREAM_OUT != 0).then(|| {
            PageFlow::new(
                Arc::clone(&self.pipeline),
                call_id.clone(),
                self.settings.window,
            )
        });
        let op = StreamOperation::new(call_id.clone(), flow.clone(), queue.clone(), None);
        if let Err(error) = self.register_call_object(call_id.clone(), Box::new(op)) {
            let dispatcher = Arc::clone(self);
            let respond_id = call_id.clone();
            tokio::spawn(async move { dispatcher.respond(respond_id, Err(error)).await });
            return;
        }
        if let Some(flow) = &flow {
            // The callee never outruns the opener; pages may flow at once.
            flow.allow();
        }

        let dispatcher = Arc::clone(self);
        let page_size = self.settings.page_size;
        tokio::spawn(async move {
            let reader = queue.map(ByteStreamReader::new);
            let writer = flow
                .clone()
                .map(|flow| ByteStreamWriter::new(flow, page_size));
            let request = InboundRequest::new(call_id.clone(), body, cancellation);
            let call = InboundStreamCall::new(request, reader, writer);
            let outcome = std::panic::AssertUnwindSafe(service.handle_stream(call))
                .catch_unwind()
                .await;
            if let Some(flow) = &flow {
                // Flush the terminal marker if the handler did not.
                let _ = flow.complete(None).await;
            }
            dispatcher.finish_request(call_id, outcome).await;
        });
    }

    async fn finish_request(
        &self,
        call_id: CallId,
        outcome: Result<CommResult<Bytes>, Box<dyn std::any::Any + Send>>,
    ) {
        self.unregister_call_object(&call_id);
        self.inflight
            .lock()
            .expect("inflight state poisoned")
            .remove(&call_id);
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = format_panic(panic);
                error!(
                    "channel {}: handler for {call_id} crashed: {message}",
                    self.ctx.id()
                );
                Err(CommError::new(RetCode::RequestCrash, message))
            }
        };
        self.respond(call_id, result).await;
    }

    async fn respond(&self, call_id: CallId, result: CommResult<Bytes>) {
        let reply = match result {
            Ok(body) => ProtocolMessage::Response { call_id, body },
            Err(error) => ProtocolMessage::Fault { call_id, error },
        };
        if let Err(error) = self.pipeline.send(&reply).await {
            debug!("channel {}: response not sent: {error}", self.ctx.id());
        }
    }

    /// Refuse new calls, fail every outstanding operation with `fault`, and
    /// wait for the worker (if any) to drain.
    pub(crate) async fn stop(&self, fault: CommError) {
        let ops = {
            let mut state = self.ops.lock().expect("ops state poisoned");
            state.accepting = false;
            state.fault = Some(fault.clone());
            mem::take(&mut state.map)
        };
        for (_, op) in ops {
            op.fail(fault.clone());
        }
        let inflight = mem::take(&mut *self.inflight.lock().expect("inflight state poisoned"));
        for (_, token) in inflight {
            token.cancel();
        }
        let queue_tx = self.queue_tx.lock().expect("queue slot poisoned").take();
        drop(queue_tx);
        let worker = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
