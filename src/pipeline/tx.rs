//! Transmit pipeline: serialization front, transport drain loop back.
//!
//! Serialization happens on the sending task while it holds the pipeline's
//! write gate, giving single-writer semantics and FIFO order for each
//! sender. The drain loop picks up ready segments and owns the transport's
//! send half until close or failure.

use std::sync::Arc;

use log::debug;
use tokio::sync::Mutex;

use crate::{
    buffer::{SegmentPool, TxBuffer},
    context::ChannelContext,
    error::{CommError, CommResult},
    message::ProtocolMessage,
    transport::BoxedTx,
};

/// Serializing front of the transmit path.
#[derive(Debug)]
pub(crate) struct TxPipeline {
    buffer: Arc<TxBuffer>,
    write_gate: Mutex<()>,
}

impl TxPipeline {
    pub(crate) fn new(buffer: Arc<TxBuffer>) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            write_gate: Mutex::new(()),
        })
    }

    /// Frame `msg` into the transmit buffer.
    ///
    /// Resolves once the message is fully encoded and visible to the drain
    /// loop; anything sent afterwards by the same caller follows it on the
    /// wire. The preamble is encoded before the buffer is locked, so an
    /// encoding failure leaves no partial frame behind.
    ///
    /// # Errors
    ///
    /// Returns the encoding failure, or `InvalidChannelState` once the
    /// pipeline has been closed.
    pub(crate) async fn send(&self, msg: &ProtocolMessage) -> CommResult<()> {
        let mut preamble = Vec::with_capacity(64);
        msg.encode_preamble(&mut preamble)?;

        let _gate = self.write_gate.lock().await;
        let mut writer = self.buffer.start_message(msg.kind())?;
        writer.write(&preamble);
        if let Some(body) = msg.body() {
            writer.write(body);
        }
        writer.end_message();
        Ok(())
    }

    /// Stop accepting messages and let the drain loop run dry.
    pub(crate) fn close(&self) { self.buffer.close(); }

    /// Committed bytes not yet drained.
    #[cfg(test)]
    pub(crate) fn backlog(&self) -> usize { self.buffer.data_size() }
}

/// Transport drain loop.
///
/// Runs until the buffer closes (clean exit, write side shut down) or the
/// transport fails (close reason reported through the context). Drained
/// segments return to the pool either way.
pub(crate) async fn run_drain(
    buffer: Arc<TxBuffer>,
    pool: Arc<SegmentPool>,
    mut transport: BoxedTx,
    ctx: Arc<ChannelContext>,
) {
    while let Some(segment) = buffer.dequeue().await {
        let result = transport.send(segment.as_slice()).await;
        pool.release(segment);
        if let Err(error) = result {
            ctx.trigger_close(CommError::from_io(&error));
            return;
        }
    }
    debug!("channel {}: tx drain finished", ctx.id());
    let _ = transport.shutdown().await;
}
