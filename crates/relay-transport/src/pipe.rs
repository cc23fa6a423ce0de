//! In-memory [`Session`]/[`Stream`] pair used by tests (and by the
//! `testsuite` crate's end-to-end scenarios) in place of a real multiplexer.
//! Grounded on `crates/mock-net`'s `tokio::io::duplex`-backed stand-in for a
//! TCP connection, generalized here to the `Session`'s multi-stream shape:
//! each `open_stream` call hands the peer a fresh duplex pair over an mpsc
//! channel instead of every byte going through one shared pipe.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{Session, Stream, TransportError};

const STREAM_BUF_SIZE: usize = 64 * 1024;
const BACKLOG: usize = 32;

/// A connected pair of in-memory sessions. Each endpoint can `open_stream`
/// against the other and `accept_stream` what the other opened.
pub struct PipePair;

impl PipePair {
    pub fn new() -> (PipeSession, PipeSession) {
        let (tx_a, rx_a) = mpsc::channel(BACKLOG);
        let (tx_b, rx_b) = mpsc::channel(BACKLOG);
        let closed = CancellationToken::new();

        let a = PipeSession {
            peer_inbound: tx_a,
            own_inbound: Mutex::new(rx_b),
            closed: closed.clone(),
        };
        let b = PipeSession {
            peer_inbound: tx_b,
            own_inbound: Mutex::new(rx_a),
            closed,
        };
        (a, b)
    }
}

pub struct PipeSession {
    /// Sends newly opened streams to the peer's `own_inbound`.
    peer_inbound: mpsc::Sender<DuplexStream>,
    /// Streams the peer opened against us.
    own_inbound: Mutex<mpsc::Receiver<DuplexStream>>,
    closed: CancellationToken,
}

#[async_trait]
impl Session for PipeSession {
    async fn open_stream(&self, cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (ours, theirs) = tokio::io::duplex(STREAM_BUF_SIZE);

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            () = cancellation.cancelled() => Err(TransportError::Cancelled),
            res = self.peer_inbound.send(theirs) => {
                res.map_err(|_| TransportError::Closed)?;
                Ok(Box::new(PipeStream::new(ours)) as Box<dyn Stream>)
            }
        }
    }

    async fn accept_stream(&self, cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.own_inbound.lock().await;

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            () = cancellation.cancelled() => Err(TransportError::Cancelled),
            stream = inbound.recv() => stream.map(|s| Box::new(PipeStream::new(s)) as Box<dyn Stream>).ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

/// One in-memory stream half. A deadline arms a [`tokio::time::Sleep`]
/// alongside the underlying poll, so a read or write pending when the
/// deadline elapses is woken and fails with `TimedOut` rather than waiting
/// for the next unrelated wakeup.
pub struct PipeStream {
    inner: DuplexStream,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    write_sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl PipeStream {
    fn new(inner: DuplexStream) -> Self {
        Self {
            inner,
            read_deadline: None,
            write_deadline: None,
            read_sleep: None,
            write_sleep: None,
        }
    }
}

/// Polls the timer for `deadline`, (re)creating it in `slot` if `deadline`
/// changed since the last poll. Ready means the deadline has elapsed.
fn poll_deadline(slot: &mut Option<Pin<Box<tokio::time::Sleep>>>, deadline: Option<Instant>, cx: &mut Context<'_>) -> Poll<io::Error> {
    let Some(deadline) = deadline else {
        *slot = None;
        return Poll::Pending;
    };

    let sleep = slot.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed")),
        Poll::Pending => Poll::Pending,
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if let Poll::Ready(err) = poll_deadline(&mut me.read_sleep, me.read_deadline, cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if let Poll::Ready(err) = poll_deadline(&mut me.write_sleep, me.write_deadline, cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut me.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Stream for PipeStream {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.read_sleep = None;
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
        self.write_sleep = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (a, b) = PipePair::new();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { b.accept_stream(&CancellationToken::new()).await });

        let mut opened = a.open_stream(&no_cancel).await.unwrap();
        opened.write_all(b"Hello, Portal!").await.unwrap();

        let mut accepted = accept.await.unwrap().unwrap();
        let mut buf = vec![0u8; 14];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello, Portal!");
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let (a, b) = PipePair::new();

        let accept = tokio::spawn(async move { b.accept_stream(&CancellationToken::new()).await });

        a.close().await.unwrap();

        let err = accept.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_wakes_a_pending_read() {
        let (a, b) = PipePair::new();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { b.accept_stream(&CancellationToken::new()).await });
        let _opened = a.open_stream(&no_cancel).await.unwrap();
        let mut accepted = accept.await.unwrap().unwrap();

        accepted.set_read_deadline(Some(Instant::now() + std::time::Duration::from_millis(50)));

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            accepted.read(&mut buf).await
        });

        tokio::time::advance(std::time::Duration::from_millis(51)).await;

        let err = read.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
