//! Paged stream transport with ack-based windowing.
//!
//! Stream calls ship ordered item sequences as pages of up to `P` items.
//! The sending side owns a credit counter initialised to the window `W`;
//! every page spends one credit and every [`crate::message::ProtocolMessage::StreamAck`]
//! restores one, bounding memory on both ends. Typed readers and writers
//! serialize whole pages through the channel's serializer; byte streams
//! bypass per-item serialization and move raw page buffers.

mod call;
mod flow;
mod queue;
mod reader;
mod writer;

pub(crate) use call::StreamOperation;
pub use call::{ByteStreamCall, CompletionHandle, StreamCall};
pub(crate) use flow::PageFlow;
pub(crate) use queue::PageQueue;
pub use queue::PageLease;
pub use reader::{ByteStreamReader, BulkEnumerator, StreamReader};
pub use writer::{ByteStreamWriter, StreamWriter};
