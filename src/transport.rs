//! Transport contract and the TCP implementation.
//!
//! The connection core drives any byte transport through two object-safe
//! halves: [`TransportTx`] for the send loop and [`TransportRx`] for the
//! receive loop. [`stream_transport`] adapts anything implementing
//! `AsyncRead + AsyncWrite` (TCP sockets, TLS sessions, in-memory duplex
//! pipes), so the TLS negotiation primitive stays an external collaborator:
//! it hands back a secured stream and this module wraps it.
//!
//! Disposal is `Drop`; a transport half releases its resources when the
//! owning pipeline task finishes.

use std::io;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{CommError, CommResult, RetCode};

/// Send half of a transport.
#[async_trait]
pub trait TransportTx: Send {
    /// Write one drained segment to the wire.
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and close the write direction.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Receive half of a transport.
#[async_trait]
pub trait TransportRx: Send {
    /// Read available bytes into `buf`, returning the count; `0` means the
    /// peer closed the connection.
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Boxed send half.
pub type BoxedTx = Box<dyn TransportTx>;
/// Boxed receive half.
pub type BoxedRx = Box<dyn TransportRx>;

/// Hook mapping a freshly dialed TCP stream to a secured transport.
///
/// Installed when TLS is enabled; the negotiation itself is supplied by the
/// caller.
pub type SecureHook =
    Box<dyn Fn(TcpStream) -> BoxFuture<'static, io::Result<(BoxedTx, BoxedRx)>> + Send + Sync>;

struct SendHalf<W> {
    io: W,
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> TransportTx for SendHalf<W> {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> { self.io.shutdown().await }
}

struct ReceiveHalf<R> {
    io: R,
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> TransportRx for ReceiveHalf<R> {
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.io.read(buf).await }
}

/// Split an async byte stream into boxed transport halves.
pub fn stream_transport<S>(io: S) -> (BoxedTx, BoxedRx)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    (
        Box::new(SendHalf { io: write }),
        Box::new(ReceiveHalf { io: read }),
    )
}

/// Resolve and dial `addr`, translating failures into the error taxonomy.
///
/// # Errors
///
/// Returns [`RetCode::HostNotFound`] when resolution yields no candidates,
/// [`RetCode::ConnectionRefused`] and friends for dial failures.
pub async fn dial(addr: &str) -> CommResult<TcpStream> {
    let mut candidates = tokio::net::lookup_host(addr)
        .await
        .map_err(|error| CommError::new(RetCode::HostNotFound, error.to_string()))?;
    let Some(first) = candidates.next() else {
        return Err(CommError::new(
            RetCode::HostNotFound,
            format!("no addresses for {addr}"),
        ));
    };
    TcpStream::connect(first)
        .await
        .map_err(|error| CommError::from_io(&error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_halves_carry_bytes_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut ctx, _crx) = stream_transport(client);
        let (_stx, mut srx) = stream_transport(server);

        ctx.send(b"ping").await.expect("send");
        let mut buf = [0u8; 16];
        let n = srx.receive(&mut buf).await.expect("receive");
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn shutdown_surfaces_as_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (mut ctx, _crx) = stream_transport(client);
        let (_stx, mut srx) = stream_transport(server);

        ctx.shutdown().await.expect("shutdown");
        drop(ctx);
        let mut buf = [0u8; 8];
        assert_eq!(srx.receive(&mut buf).await.expect("receive"), 0);
    }

    #[tokio::test]
    async fn dial_unresolvable_host_maps_to_host_not_found() {
        let err = dial("definitely-not-a-real-host.invalid:1").await.expect_err("must fail");
        assert_eq!(err.code, RetCode::HostNotFound);
    }
}
