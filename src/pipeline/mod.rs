//! Send and receive pipelines between the message layer and the transport.
//!
//! The transmit side serializes on the calling task under a single write
//! gate and lets a drain task ship completed segments; the receive side is
//! one driver task that reads, parses, and dispatches inline.

mod rx;
mod tx;

pub(crate) use rx::{InboundSink, run_receive};
pub(crate) use tx::{TxPipeline, run_drain};
