//! Connection core for typed RPC over a framed byte transport.
//!
//! This crate provides the machinery one end of an RPC conversation runs:
//! segmented transmit/receive buffering, a message dispatcher correlating
//! calls with responses, paged streaming with ack-based backpressure, the
//! login/logout session handshake, and the channel lifecycle tying them
//! together. Message bodies are opaque to the core; plug in a
//! [`serializer::Serializer`] (bincode by default) and, for TLS, a secure
//! hook mapping sockets to transports.

pub mod buffer;
pub mod byte_order;
pub mod channel;
pub mod config;
mod context;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod panic;
mod pipeline;
pub mod serializer;
pub mod service;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use channel::{Channel, ChannelEvents, ChannelState, EventArgs, EventObserver};
pub use config::ChannelConfig;
pub use dispatch::DispatchMode;
pub use error::{CommError, CommResult, RetCode};
pub use message::{CallId, Credentials};
pub use serializer::{BincodeSerializer, DecodeWith, EncodeWith, Serializer};
pub use service::{InboundRequest, InboundStreamCall, ServiceHandler};
pub use session::Authenticator;
pub use stream::{
    ByteStreamCall, ByteStreamReader, ByteStreamWriter, CompletionHandle, StreamCall,
    StreamReader, StreamWriter,
};
