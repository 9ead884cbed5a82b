//! Top-level channel: lifecycle state machine and public call surface.
//!
//! A channel ties the buffers, pipelines, dispatcher, and session
//! coordinator together. Client channels are created with
//! [`Channel::new_client`] and driven through [`Channel::try_connect`];
//! server channels wrap an accepted transport via [`Channel::serve_stream`].
//! All components receive a shared [`crate::context::ChannelContext`]
//! instead of a back-pointer, and the first close reason reported through it
//! wins: a dedicated supervisor task runs the shutdown sequence exactly
//! once, whether the trigger was a local close, a transport fault, or a
//! protocol violation.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use log::{debug, error, info};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{RxBuffer, SegmentPool, TxBuffer},
    config::ChannelConfig,
    context::{ChannelContext, next_channel_id},
    dispatch::{DispatchSettings, MessageDispatcher},
    error::{CommError, CommResult, RetCode},
    message::ProtocolMessage,
    panic::format_panic,
    pipeline::{InboundSink, TxPipeline, run_drain, run_receive},
    serializer::{BincodeSerializer, DecodeWith, EncodeWith, Serializer},
    service::ServiceHandler,
    session::{Authenticator, SessionCoordinator, SessionRole},
    stream::{
        ByteStreamCall, ByteStreamReader, ByteStreamWriter, StreamCall, StreamReader, StreamWriter,
    },
    transport::{BoxedRx, BoxedTx, SecureHook, dial, stream_transport},
};

/// Lifecycle states of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, not yet connected.
    New,
    /// Handshake in progress.
    Connecting,
    /// Session established; user traffic flows.
    Online,
    /// Shutdown sequence running.
    Disconnecting,
    /// Closed gracefully.
    Closed,
    /// Closed by a fault; see [`Channel::fault`].
    Faulted,
}

/// Arguments passed to channel event observers.
#[derive(Clone, Debug)]
pub struct EventArgs {
    /// Id of the channel raising the event.
    pub channel_id: u64,
    /// Close or failure reason, where applicable.
    pub reason: Option<CommError>,
}

/// Async observer callback for one channel event.
pub type EventObserver = Box<dyn Fn(EventArgs) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer set registered at channel construction; one callback per event.
#[derive(Default)]
pub struct ChannelEvents {
    /// Fired when a connect attempt starts.
    pub opening: Option<EventObserver>,
    /// Fired when the shutdown sequence starts (connected channels only).
    pub closing: Option<EventObserver>,
    /// Fired when the shutdown sequence finishes (connected channels only).
    pub closed: Option<EventObserver>,
    /// Fired when a connect attempt fails; exactly once per attempt.
    pub failed_to_connect: Option<EventObserver>,
}

impl ChannelEvents {
    async fn fire(&self, which: &str, slot: &Option<EventObserver>, args: EventArgs) {
        let Some(observer) = slot else { return };
        let outcome = std::panic::AssertUnwindSafe(observer(args)).catch_unwind().await;
        if let Err(panic) = outcome {
            error!(
                "{:?}: {which} observer panicked: {}",
                RetCode::EventHandlerCrash,
                format_panic(panic)
            );
        }
    }
}

struct ChannelCore {
    pipeline: Arc<TxPipeline>,
    dispatcher: Arc<MessageDispatcher>,
    coordinator: Arc<SessionCoordinator>,
    rx_token: CancellationToken,
    drain: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    rx_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct ChannelSink {
    ctx: Arc<ChannelContext>,
    dispatcher: Arc<MessageDispatcher>,
    coordinator: Arc<SessionCoordinator>,
    role: SessionRole,
}

#[async_trait]
impl InboundSink for ChannelSink {
    async fn deliver(&self, msg: ProtocolMessage) {
        if msg.kind().is_session_control() {
            self.coordinator.on_message(msg).await;
            return;
        }
        // The server side admits no user traffic before the session exists.
        if self.role == SessionRole::Server && !self.coordinator.is_logged_in() {
            self.ctx.trigger_close(CommError::new(
                RetCode::ProtocolViolation,
                format!("{:?} before login completed", msg.kind()),
            ));
            return;
        }
        self.dispatcher.on_message(msg).await;
    }
}

/// One end of a bidirectional RPC conversation over a framed transport.
pub struct Channel<S: Serializer = BincodeSerializer> {
    id: u64,
    address: Option<String>,
    config: ChannelConfig,
    serializer: S,
    events: Arc<ChannelEvents>,
    state: Arc<std::sync::Mutex<ChannelState>>,
    was_online: Arc<AtomicBool>,
    close_flag: Arc<watch::Sender<bool>>,
    ctx: OnceLock<Arc<ChannelContext>>,
    core: OnceLock<Arc<ChannelCore>>,
    secure: std::sync::Mutex<Option<SecureHook>>,
    authenticator: Option<Authenticator>,
}

impl<S: Serializer> std::fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

impl Channel<BincodeSerializer> {
    /// Create a client channel for `address` with the default serializer.
    #[must_use]
    pub fn new_client(
        address: impl Into<String>,
        config: ChannelConfig,
        events: ChannelEvents,
    ) -> Self {
        Self::new_client_with(address, config, events, BincodeSerializer)
    }
}

impl<S: Serializer> Channel<S> {
    /// Create a client channel for `address` with a custom serializer.
    #[must_use]
    pub fn new_client_with(
        address: impl Into<String>,
        config: ChannelConfig,
        events: ChannelEvents,
        serializer: S,
    ) -> Self {
        let mut channel = Self::new_detached(config, events, serializer);
        channel.address = Some(address.into());
        channel
    }

    fn new_detached(config: ChannelConfig, events: ChannelEvents, serializer: S) -> Self {
        Self {
            id: next_channel_id(),
            address: None,
            config,
            serializer,
            events: Arc::new(events),
            state: Arc::new(std::sync::Mutex::new(ChannelState::New)),
            was_online: Arc::new(AtomicBool::new(false)),
            close_flag: Arc::new(watch::channel(false).0),
            ctx: OnceLock::new(),
            core: OnceLock::new(),
            secure: std::sync::Mutex::new(None),
            authenticator: None,
        }
    }

    /// Connect the client side over a caller-supplied byte stream.
    ///
    /// Used when the transport is already established (an in-process pipe, a
    /// pre-secured session); the login handshake still runs before the
    /// channel comes back `Online`.
    ///
    /// # Errors
    ///
    /// As [`Channel::try_connect`].
    pub async fn connect_stream<T>(
        io: T,
        config: ChannelConfig,
        events: ChannelEvents,
        serializer: S,
    ) -> CommResult<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Self::new_detached(config, events, serializer);
        channel.begin_connect().await?;
        let (tx_half, rx_half) = stream_transport(io);
        channel.install_core(tx_half, rx_half, SessionRole::Client, None);
        let login = channel
            .core
            .get()
            .expect("core just installed")
            .coordinator
            .login(channel.config.credentials.clone())
            .await;
        channel.finish_connect(login).await?;
        Ok(channel)
    }

    /// Wrap an accepted transport as the server end of a channel.
    ///
    /// The acceptor stays external: whatever hands out connected streams
    /// calls this per connection. The channel is immediately live, but the
    /// dispatcher admits no user traffic until the peer completes login.
    #[must_use]
    pub fn serve_stream<T>(
        io: T,
        config: ChannelConfig,
        events: ChannelEvents,
        serializer: S,
        handler: Arc<dyn ServiceHandler>,
        authenticator: Option<Authenticator>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel = Self {
            id: next_channel_id(),
            address: None,
            config,
            serializer,
            events: Arc::new(events),
            state: Arc::new(std::sync::Mutex::new(ChannelState::Online)),
            was_online: Arc::new(AtomicBool::new(true)),
            close_flag: Arc::new(watch::channel(false).0),
            ctx: OnceLock::new(),
            core: OnceLock::new(),
            secure: std::sync::Mutex::new(None),
            authenticator,
        };
        let (tx_half, rx_half) = stream_transport(io);
        channel.install_core(tx_half, rx_half, SessionRole::Server, Some(handler));
        channel
    }

    /// Install the hook mapping dialed sockets to secured transports.
    ///
    /// Must be called before [`Channel::try_connect`]; only consulted when
    /// the configuration enables TLS.
    pub fn set_secure_hook(&self, hook: SecureHook) {
        *self.secure.lock().expect("secure hook poisoned") = Some(hook);
    }

    /// Channel id, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState { *self.state.lock().expect("channel state poisoned") }

    /// The first close reason recorded, if any.
    #[must_use]
    pub fn fault(&self) -> Option<CommError> {
        self.ctx.get().and_then(|ctx| ctx.close_reason())
    }

    /// The serializer this channel encodes bodies with.
    #[must_use]
    pub fn serializer(&self) -> &S { &self.serializer }

    /// Dial, secure, and run the login handshake.
    ///
    /// Idempotence: only a channel in `New` starts a connect; any later call
    /// observes a stable [`RetCode::InvalidChannelState`] and never starts a
    /// second handshake.
    ///
    /// # Errors
    ///
    /// Dial failures, [`RetCode::SecurityError`],
    /// [`RetCode::InvalidCredentials`], and [`RetCode::LoginTimeout`] all
    /// leave the channel `Faulted` with the `failed_to_connect` observer
    /// fired exactly once.
    pub async fn try_connect(&self) -> CommResult<()> {
        self.begin_connect().await?;
        let result = self.connect_and_login().await;
        self.finish_connect(result).await
    }

    async fn begin_connect(&self) -> CommResult<()> {
        {
            let mut state = self.state.lock().expect("channel state poisoned");
            if *state != ChannelState::New {
                return Err(CommError::new(
                    RetCode::InvalidChannelState,
                    format!("connect in state {:?}", *state),
                ));
            }
            *state = ChannelState::Connecting;
        }
        self.events
            .fire(
                "opening",
                &self.events.opening,
                EventArgs {
                    channel_id: self.id,
                    reason: None,
                },
            )
            .await;
        Ok(())
    }

    async fn finish_connect(&self, result: CommResult<()>) -> CommResult<()> {
        match result {
            Ok(()) => {
                *self.state.lock().expect("channel state poisoned") = ChannelState::Online;
                self.was_online.store(true, Ordering::Release);
                info!("channel {}: online", self.id);
                Ok(())
            }
            Err(error) => {
                if let Some(ctx) = self.ctx.get() {
                    // Tear down whatever was already running, then report.
                    ctx.trigger_close(error.clone());
                    let mut done = self.close_flag.subscribe();
                    let _ = done.wait_for(|flag| *flag).await;
                } else {
                    let _ = self.close_flag.send(true);
                }
                {
                    let mut state = self.state.lock().expect("channel state poisoned");
                    if *state != ChannelState::Closed {
                        *state = ChannelState::Faulted;
                    }
                }
                self.events
                    .fire(
                        "failed_to_connect",
                        &self.events.failed_to_connect,
                        EventArgs {
                            channel_id: self.id,
                            reason: Some(error.clone()),
                        },
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn connect_and_login(&self) -> CommResult<()> {
        let address = self
            .address
            .clone()
            .ok_or_else(|| CommError::new(RetCode::InvalidChannelState, "server channel"))?;
        let stream = dial(&address).await?;

        let (tx_half, rx_half) = if self.config.tls_enabled {
            let hook = self.secure.lock().expect("secure hook poisoned").take();
            let Some(hook) = hook else {
                return Err(CommError::new(
                    RetCode::SecurityError,
                    "tls enabled but no secure hook installed",
                ));
            };
            hook(stream)
                .await
                .map_err(|error| CommError::new(RetCode::SecurityError, error.to_string()))?
        } else {
            stream_transport(stream)
        };

        self.install_core(tx_half, rx_half, SessionRole::Client, None);
        let core = self.core.get().expect("core just installed");
        core.coordinator
            .login(self.config.credentials.clone())
            .await
    }

    fn install_core(
        &self,
        tx_half: BoxedTx,
        rx_half: BoxedRx,
        role: SessionRole,
        service: Option<Arc<dyn ServiceHandler>>,
    ) {
        let (close_tx, close_rx) = mpsc::channel(1);
        let ctx = Arc::new(ChannelContext::new(self.id, close_tx));
        self.ctx.set(Arc::clone(&ctx)).ok();

        let pool = Arc::new(SegmentPool::new(
            self.config.tx_segment_size,
            self.config.pool_max_idle,
        ));
        let tx_buffer = Arc::new(TxBuffer::new(Arc::clone(&pool)));
        let pipeline = TxPipeline::new(Arc::clone(&tx_buffer));
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&ctx),
            Arc::clone(&pipeline),
            service,
            DispatchSettings {
                mode: self.config.dispatch_mode,
                queue_depth: self.config.queue_depth,
                page_size: self.config.page_size,
                window: self.config.window,
            },
        );
        let coordinator = SessionCoordinator::new(
            Arc::clone(&ctx),
            Arc::clone(&pipeline),
            role,
            self.config.login_timeout,
            self.config.logout_timeout,
            self.authenticator.clone(),
        );

        let rx_token = CancellationToken::new();
        let sink: Arc<dyn InboundSink> = Arc::new(ChannelSink {
            ctx: Arc::clone(&ctx),
            dispatcher: Arc::clone(&dispatcher),
            coordinator: Arc::clone(&coordinator),
            role,
        });
        let drain = tokio::spawn(run_drain(
            Arc::clone(&tx_buffer),
            pool,
            tx_half,
            Arc::clone(&ctx),
        ));
        let rx_task = tokio::spawn(run_receive(
            rx_half,
            RxBuffer::new(self.config.rx_segment_size),
            sink,
            rx_token.clone(),
            Arc::clone(&ctx),
        ));

        let core = Arc::new(ChannelCore {
            pipeline,
            dispatcher,
            coordinator,
            rx_token,
            drain: std::sync::Mutex::new(Some(drain)),
            rx_task: std::sync::Mutex::new(Some(rx_task)),
        });
        self.core.set(Arc::clone(&core)).ok();

        tokio::spawn(run_supervisor(SupervisorArgs {
            core,
            close_rx,
            events: Arc::clone(&self.events),
            state: Arc::clone(&self.state),
            was_online: Arc::clone(&self.was_online),
            close_flag: Arc::clone(&self.close_flag),
            channel_id: self.id,
            drain_grace: self.config.drain_grace,
        }));
    }

    /// Trigger a graceful close and wait for the shutdown to finish.
    ///
    /// Idempotent: reentrant and concurrent callers all await the same
    /// completion; on an already-faulted channel it returns immediately.
    pub async fn close(&self) {
        match self.ctx.get() {
            Some(ctx) => ctx.trigger_close(CommError::code(RetCode::ChannelClosed)),
            None => {
                // Never connected; nothing to tear down.
                let mut state = self.state.lock().expect("channel state poisoned");
                if *state == ChannelState::New {
                    *state = ChannelState::Closed;
                }
                drop(state);
                let _ = self.close_flag.send(true);
                return;
            }
        }
        let mut done = self.close_flag.subscribe();
        let _ = done.wait_for(|flag| *flag).await;
    }

    fn online_core(&self) -> CommResult<&Arc<ChannelCore>> {
        let state = self.state();
        if state != ChannelState::Online {
            return Err(CommError::new(
                RetCode::InvalidChannelState,
                format!("call in state {state:?}"),
            ));
        }
        self.core
            .get()
            .ok_or_else(|| CommError::new(RetCode::InvalidChannelState, "not connected"))
    }

    /// Issue a call with an opaque body and await the raw response body.
    ///
    /// # Errors
    ///
    /// Resolves with the fault the call or channel failed with.
    pub async fn call(&self, body: Bytes) -> CommResult<Bytes> {
        self.online_core()?.dispatcher.call(body, 0).await
    }

    /// Issue a cancellable call; `cancel` aborts the wait with
    /// [`RetCode::OperationCanceled`] and sends a best-effort cancel to the
    /// service.
    ///
    /// # Errors
    ///
    /// As [`Channel::call`], plus cancellation.
    pub async fn call_cancellable(
        &self,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> CommResult<Bytes> {
        self.online_core()?
            .dispatcher
            .call_with_cancel(body, crate::message::REQUEST_CANCELLABLE, Some(cancel))
            .await
    }

    /// Issue a typed call: serialize `request`, await and decode the
    /// response.
    ///
    /// # Errors
    ///
    /// As [`Channel::call`], plus serialization failures on either side.
    pub async fn try_call<Req, Ret>(&self, request: &Req) -> CommResult<Ret>
    where
        Req: EncodeWith<S>,
        Ret: DecodeWith<S>,
    {
        let body = Bytes::from(self.serializer.serialize(request)?);
        let response = self.call(body).await?;
        self.serializer.deserialize(&response)
    }

    /// Send a one-way user message; no response, no correlation.
    ///
    /// # Errors
    ///
    /// Fails when the channel is not online or encoding fails.
    pub async fn send_message<Req>(&self, message: &Req) -> CommResult<()>
    where
        Req: EncodeWith<S>,
    {
        let body = Bytes::from(self.serializer.serialize(message)?);
        self.online_core()?
            .pipeline
            .send(&ProtocolMessage::Message { body })
            .await
    }

    /// Open a typed stream call.
    ///
    /// `input`/`output` select the directions; the opening request carries
    /// `body`. Pages never precede the opener on the wire.
    ///
    /// # Errors
    ///
    /// Fails when the channel is not online or the opener cannot be sent.
    pub async fn open_stream<In, Out>(
        &self,
        body: Bytes,
        input: bool,
        output: bool,
    ) -> CommResult<StreamCall<In, Out, S>>
    where
        In: Send + 'static,
        Out: Send + 'static,
        Vec<In>: EncodeWith<S>,
        Vec<Out>: DecodeWith<S>,
    {
        let core = self.online_core()?;
        let (flow, queue, completion) = core
            .dispatcher
            .open_stream_call(body, input, output, false)
            .await?;
        Ok(StreamCall::new(
            flow.map(|flow| {
                StreamWriter::new(flow, self.serializer.clone(), self.config.page_size)
            }),
            queue.map(|queue| StreamReader::new(queue, self.serializer.clone())),
            completion,
        ))
    }

    /// Open a byte stream call; pages are raw buffers of up to the
    /// configured page size.
    ///
    /// # Errors
    ///
    /// As [`Channel::open_stream`].
    pub async fn open_byte_stream(
        &self,
        body: Bytes,
        input: bool,
        output: bool,
    ) -> CommResult<ByteStreamCall> {
        let core = self.online_core()?;
        let (flow, queue, completion) = core
            .dispatcher
            .open_stream_call(body, input, output, false)
            .await?;
        Ok(ByteStreamCall::new(
            flow.map(|flow| ByteStreamWriter::new(flow, self.config.page_size)),
            queue.map(ByteStreamReader::new),
            completion,
        ))
    }

    /// Number of calls the dispatcher currently tracks.
    #[must_use]
    pub fn outstanding_calls(&self) -> usize {
        self.core
            .get()
            .map_or(0, |core| core.dispatcher.outstanding_calls())
    }
}

struct SupervisorArgs {
    core: Arc<ChannelCore>,
    close_rx: mpsc::Receiver<CommError>,
    events: Arc<ChannelEvents>,
    state: Arc<std::sync::Mutex<ChannelState>>,
    was_online: Arc<AtomicBool>,
    close_flag: Arc<watch::Sender<bool>>,
    channel_id: u64,
    drain_grace: std::time::Duration,
}

fn is_transport_fault(code: RetCode) -> bool {
    matches!(
        code,
        RetCode::ConnectionShutdown
            | RetCode::ConnectionAbortedByPeer
            | RetCode::ConnectionTimeout
            | RetCode::ConnectionRefused
            | RetCode::HostNotFound
            | RetCode::HostUnreachable
            | RetCode::OtherConnectionError
            | RetCode::ChannelClosedByOtherSide
            | RetCode::SecurityError
    )
}

/// Shutdown driver: waits for the first close reason, then runs the
/// teardown sequence exactly once.
async fn run_supervisor(mut args: SupervisorArgs) {
    let reason = args
        .close_rx
        .recv()
        .await
        .unwrap_or_else(|| CommError::code(RetCode::ChannelClosed));
    let was_online = args.was_online.load(Ordering::Acquire);

    {
        let mut state = args.state.lock().expect("channel state poisoned");
        *state = ChannelState::Disconnecting;
    }
    if was_online {
        args.events
            .fire(
                "closing",
                &args.events.closing,
                EventArgs {
                    channel_id: args.channel_id,
                    reason: Some(reason.clone()),
                },
            )
            .await;
    }

    // Logout runs before component shutdown, except when the transport is
    // already gone.
    if !is_transport_fault(reason.code) {
        args.core.coordinator.logout().await;
    }
    args.core.coordinator.shutdown();
    args.core.dispatcher.stop(reason.clone()).await;

    args.core.pipeline.close();
    let drain = args.core.drain.lock().expect("drain slot poisoned").take();
    if let Some(mut drain) = drain
        && tokio::time::timeout(args.drain_grace, &mut drain).await.is_err()
    {
        drain.abort();
        debug!(
            "channel {}: drain grace expired, dropping the transport",
            args.channel_id
        );
    }

    args.core.rx_token.cancel();
    let rx_task = args.core.rx_task.lock().expect("rx slot poisoned").take();
    if let Some(mut rx_task) = rx_task
        && tokio::time::timeout(args.drain_grace, &mut rx_task).await.is_err()
    {
        // An inline handler that never yields would pin the receive task.
        rx_task.abort();
        debug!("channel {}: rx task aborted after grace", args.channel_id);
    }

    let final_state = match reason.code {
        RetCode::ChannelClosed | RetCode::ChannelClosedByOtherSide => ChannelState::Closed,
        _ => ChannelState::Faulted,
    };
    {
        let mut state = args.state.lock().expect("channel state poisoned");
        *state = final_state;
    }
    info!(
        "channel {}: {final_state:?} ({:?})",
        args.channel_id, reason.code
    );

    if was_online {
        args.events
            .fire(
                "closed",
                &args.events.closed,
                EventArgs {
                    channel_id: args.channel_id,
                    reason: Some(reason),
                },
            )
            .await;
    }
    let _ = args.close_flag.send(true);
}
