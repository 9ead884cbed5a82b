#![cfg(any(test, feature = "test-helpers"))]
//! Test-only helpers: in-memory channel pairs and canned service handlers.
//!
//! The whole stack is exercised without sockets by joining a client and a
//! server channel over a `tokio::io::duplex` pipe.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    channel::{Channel, ChannelEvents},
    config::ChannelConfig,
    error::{CommError, CommResult, RetCode},
    serializer::{BincodeSerializer, Serializer},
    service::{InboundRequest, InboundStreamCall, ServiceHandler},
};

/// Echo service used by most harness tests.
///
/// Unary requests echo their body, except the literal bincode string
/// `"ping"`, which is answered with `"pong"`. Stream calls pipe the input
/// byte stream back to the output (when both directions exist) and respond
/// with the total byte count, bincode-encoded.
pub struct EchoService;

#[async_trait]
impl ServiceHandler for EchoService {
    async fn handle_request(&self, request: InboundRequest) -> CommResult<Bytes> {
        let serializer = BincodeSerializer;
        if let Ok(text) = serializer.deserialize::<String>(request.body())
            && text == "ping"
        {
            return Ok(Bytes::from(serializer.serialize(&"pong".to_string())?));
        }
        Ok(request.body().clone())
    }

    async fn handle_stream(&self, mut call: InboundStreamCall) -> CommResult<Bytes> {
        let input = call.take_input();
        let output = call.take_output();
        let mut total: u64 = 0;

        if let Some(input) = input {
            let mut buf = [0u8; 4096];
            loop {
                let n = input.read_chunk(&mut buf).await?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                if let Some(output) = &output {
                    output.write_chunk(&buf[..n]).await?;
                }
            }
        }
        if let Some(output) = &output {
            output.complete().await?;
        }
        Ok(Bytes::from(BincodeSerializer.serialize(&total)?))
    }
}

/// Service whose unary handler always fails with [`RetCode::RequestFault`].
pub struct FaultingService;

#[async_trait]
impl ServiceHandler for FaultingService {
    async fn handle_request(&self, _request: InboundRequest) -> CommResult<Bytes> {
        Err(CommError::new(RetCode::RequestFault, "always refused"))
    }
}

/// Service whose unary handler panics, exercising crash containment.
pub struct PanickingService;

#[async_trait]
impl ServiceHandler for PanickingService {
    async fn handle_request(&self, _request: InboundRequest) -> CommResult<Bytes> {
        panic!("handler blew up");
    }
}

/// Join a client and a server channel over an in-memory pipe.
///
/// The returned server channel must be kept alive for the duration of the
/// test; dropping it does not tear the connection down, but losing it loses
/// access to its state.
///
/// # Panics
///
/// Panics when the handshake fails; tests covering handshake failures drive
/// [`Channel::connect_stream`] directly.
pub async fn connected_pair(
    client_config: ChannelConfig,
    server_config: ChannelConfig,
    handler: Arc<dyn ServiceHandler>,
) -> (Channel, Channel) {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let server = Channel::serve_stream(
        server_io,
        server_config,
        ChannelEvents::default(),
        BincodeSerializer,
        handler,
        None,
    );
    let client = Channel::connect_stream(
        client_io,
        client_config,
        ChannelEvents::default(),
        BincodeSerializer,
    )
    .await
    .expect("in-memory handshake");
    (client, server)
}

/// [`connected_pair`] with default configurations and the echo service.
pub async fn echo_pair() -> (Channel, Channel) {
    connected_pair(
        ChannelConfig::default(),
        ChannelConfig::default(),
        Arc::new(EchoService),
    )
    .await
}
