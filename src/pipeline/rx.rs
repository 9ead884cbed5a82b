//! Receive pipeline: transport reads, frame parsing, inbound dispatch.
//!
//! One driver task owns the transport's receive half. Bytes land in the
//! [`RxBuffer`] window, complete messages are decoded and handed to the
//! channel's [`InboundSink`] inline, and any parse failure closes the
//! channel with a protocol violation.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::RxBuffer,
    context::ChannelContext,
    error::{CommError, RetCode},
    message::ProtocolMessage,
    transport::BoxedRx,
};

/// Consumer of decoded inbound messages.
#[async_trait]
pub(crate) trait InboundSink: Send + Sync {
    /// Route one decoded message; runs on the receive task.
    async fn deliver(&self, msg: ProtocolMessage);
}

/// Receive driver loop.
///
/// Exits when the close token fires, the peer closes the connection, or a
/// transport/parse error occurs; the latter two report a close reason
/// through the context.
pub(crate) async fn run_receive(
    mut transport: BoxedRx,
    mut buffer: RxBuffer,
    sink: Arc<dyn InboundSink>,
    token: CancellationToken,
    ctx: Arc<ChannelContext>,
) {
    loop {
        loop {
            match buffer.next_message() {
                Ok(Some((kind, payload))) => match ProtocolMessage::decode(kind, payload) {
                    Ok(msg) => sink.deliver(msg).await,
                    Err(error) => {
                        ctx.trigger_close(error);
                        return;
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    ctx.trigger_close(error);
                    return;
                }
            }
        }

        let received = tokio::select! {
            () = token.cancelled() => {
                debug!("channel {}: rx pipeline stopped", ctx.id());
                return;
            }
            result = transport.receive(buffer.rx_window()) => result,
        };
        match received {
            Ok(0) => {
                buffer.commit_rx(0);
                ctx.trigger_close(CommError::new(
                    RetCode::ChannelClosedByOtherSide,
                    "peer closed the connection",
                ));
                return;
            }
            Ok(n) => buffer.commit_rx(n),
            Err(error) => {
                ctx.trigger_close(CommError::from_io(&error));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::{io::AsyncWriteExt, sync::mpsc};

    use super::*;
    use crate::{
        context::next_channel_id,
        frame::{HEADER_LEN, MessageHeader, MessageKind},
        transport::stream_transport,
    };

    struct Collect(Mutex<Vec<ProtocolMessage>>);

    #[async_trait]
    impl InboundSink for Collect {
        async fn deliver(&self, msg: ProtocolMessage) {
            self.0.lock().expect("collect poisoned").push(msg);
        }
    }

    fn raw_frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        MessageHeader::new(payload.len() as u32, kind, 0).encode(&mut out);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn delivers_decoded_messages_until_peer_close() {
        let (mut near, far) = tokio::io::duplex(1024);
        let (_far_tx, far_rx) = stream_transport(far);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let ctx = Arc::new(ChannelContext::new(next_channel_id(), close_tx));
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let driver = tokio::spawn(run_receive(
            far_rx,
            RxBuffer::new(64),
            Arc::clone(&sink) as Arc<dyn InboundSink>,
            CancellationToken::new(),
            ctx,
        ));

        near.write_all(&raw_frame(MessageKind::Message, b"payload"))
            .await
            .expect("write");
        near.shutdown().await.expect("shutdown");
        drop(near);

        driver.await.expect("driver");
        let seen = sink.0.lock().expect("collect poisoned");
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], ProtocolMessage::Message { .. }));
        assert_eq!(
            close_rx.recv().await.expect("reason").code,
            RetCode::ChannelClosedByOtherSide
        );
    }

    #[tokio::test]
    async fn malformed_header_faults_the_channel() {
        let (mut near, far) = tokio::io::duplex(1024);
        let (_far_tx, far_rx) = stream_transport(far);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let ctx = Arc::new(ChannelContext::new(next_channel_id(), close_tx));
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let driver = tokio::spawn(run_receive(
            far_rx,
            RxBuffer::new(64),
            sink as Arc<dyn InboundSink>,
            CancellationToken::new(),
            ctx,
        ));

        let mut garbage = raw_frame(MessageKind::Message, b"x");
        garbage[4] = 0xEE; // unknown kind byte
        near.write_all(&garbage).await.expect("write");

        assert_eq!(
            close_rx.recv().await.expect("reason").code,
            RetCode::ProtocolViolation
        );
        driver.await.expect("driver");
    }

    #[tokio::test]
    async fn cancellation_stops_the_driver_quietly() {
        let (near, far) = tokio::io::duplex(64);
        let (_far_tx, far_rx) = stream_transport(far);
        let (close_tx, mut close_rx) = mpsc::channel(1);
        let ctx = Arc::new(ChannelContext::new(next_channel_id(), close_tx));
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let token = CancellationToken::new();
        let driver = tokio::spawn(run_receive(
            far_rx,
            RxBuffer::new(64),
            sink as Arc<dyn InboundSink>,
            token.clone(),
            ctx,
        ));

        token.cancel();
        driver.await.expect("driver");
        assert!(close_rx.try_recv().is_err(), "no close reason on plain stop");
        drop(near);
    }
}
