//! The single seam between the dispatch engine and any concrete multiplexed
//! connection (a QUIC/yamux/WebSocket stream multiplexer in production, an
//! in-memory [`pipe::PipePair`] in tests). The engine never reaches past
//! [`Session`]/[`Stream`] into a concrete transport.

#[macro_use]
extern crate tracing;

mod copy;
mod pipe;

pub use copy::{CopyBidirectionalResult, RelayCopyHook, copy_bidirectional};
pub use pipe::PipePair;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Errors surfaced at the transport seam. `spec.md` §7 names these as the
/// transport-level error kinds; everything else (framing, decode, policy) is
/// layered by `relay-proto`/`relay-engine` on top.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session or stream was closed, either by the peer, by `close()`, or
    /// by the cancellation token passed to `open_stream`/`accept_stream`.
    #[error("transport closed")]
    Closed,
    /// The caller-supplied cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A multiplexed connection: opens and accepts bidirectional sub-streams.
///
/// `close()` is idempotent and must cause every other pending or future
/// `open_stream`/`accept_stream` call on this session to resolve with
/// [`TransportError::Closed`].
#[async_trait]
pub trait Session: Send + Sync {
    /// Opens a new, locally-initiated sub-stream.
    async fn open_stream(&self, cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError>;

    /// Blocks until the remote peer initiates a sub-stream, the session
    /// closes, or `cancellation` fires.
    async fn accept_stream(&self, cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError>;

    /// Idempotent close; unblocks any in-flight `open`/`accept` call.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A reliable, ordered, full-duplex byte channel with independent per-direction deadlines.
///
/// Implementors are boxed as trait objects (`Box<dyn Stream>`); the
/// `AsyncRead`/`AsyncWrite` supertraits make that box usable directly with
/// `tokio::io::copy_bidirectional` or [`copy_bidirectional`].
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Sets (or, given `None`, disables) the deadline for pending and future reads.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Sets (or, given `None`, disables) the deadline for pending and future writes.
    fn set_write_deadline(&mut self, deadline: Option<Instant>);
}

impl AsyncRead for Box<dyn Stream> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_read(cx, buf)
    }
}

impl AsyncWrite for Box<dyn Stream> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut **self).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self).poll_shutdown(cx)
    }
}

impl Stream for Box<dyn Stream> {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        (**self).set_read_deadline(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        (**self).set_write_deadline(deadline);
    }
}
