//! Segmented buffering between the serialization layer and the transport.
//!
//! Outbound messages are framed into fixed-capacity [`Segment`]s drawn from a
//! shared [`SegmentPool`]; the transport drains whole segments, so it can
//! start sending before a large message finishes encoding and many small
//! messages can share one segment. Inbound bytes land in an [`RxBuffer`]
//! that reconstitutes message boundaries, including chunked payloads.

mod pool;
mod rx;
mod tx;

pub use pool::{Segment, SegmentPool};
pub use rx::RxBuffer;
pub use tx::{MessageWriter, TxBuffer};
