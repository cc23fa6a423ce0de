use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_transport::{Session, Stream, TransportError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::frame::{FrameKind, MuxFrame, MuxFrameCodec};

const ACCEPT_BACKLOG: usize = 64;

/// Which side of the connection a [`TcpMuxSession`] plays: determines stream
/// id parity so both sides can allocate ids independently without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Initiator,
    Acceptor,
}

type StreamsMap = Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>;

/// A multiplexed session over one underlying reliable byte connection (a raw
/// TCP socket in practice). Sub-streams are distinguished by a `u32` id
/// carried on every frame; opening is an explicit frame rather than
/// inferred from the first data frame, so a stream opened but never written
/// to is still observable by the peer's `accept_stream`.
pub struct TcpMuxSession {
    writer_tx: mpsc::UnboundedSender<MuxFrame>,
    streams: Arc<StreamsMap>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_local_id: AtomicU32,
    closed: CancellationToken,
    driver: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl TcpMuxSession {
    pub fn new<T>(io: T, role: MuxRole) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<MuxFrame>();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let streams: Arc<StreamsMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let writer = tokio::spawn(run_writer(write_half, writer_rx, closed.clone()));
        let driver = tokio::spawn(run_driver(
            read_half,
            streams.clone(),
            accept_tx,
            writer_tx.clone(),
            closed.clone(),
        ));

        let start = match role {
            MuxRole::Initiator => 0u32,
            MuxRole::Acceptor => 1u32,
        };

        Arc::new(Self {
            writer_tx,
            streams,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_local_id: AtomicU32::new(start),
            closed,
            driver,
            writer,
        })
    }
}

impl TcpMuxSession {
    fn alloc_id(&self) -> u32 {
        self.next_local_id.fetch_add(2, Ordering::Relaxed)
    }
}

async fn run_writer<W>(write_half: W, mut writer_rx: mpsc::UnboundedReceiver<MuxFrame>, closed: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(write_half, MuxFrameCodec);

    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            frame = writer_rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_driver<R>(
    read_half: R,
    streams: Arc<StreamsMap>,
    accept_tx: mpsc::Sender<MuxStream>,
    writer_tx: mpsc::UnboundedSender<MuxFrame>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut source = FramedRead::new(read_half, MuxFrameCodec);

    loop {
        let next = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                debug!(%error, "Mux frame decode failed, closing session");
                break;
            }
            None => break,
        };

        match frame.kind {
            FrameKind::Open => {
                let (tx, rx) = mpsc::unbounded_channel();
                streams.lock().insert(frame.stream_id, tx);
                let stream = MuxStream::new(frame.stream_id, rx, writer_tx.clone());
                if accept_tx.send(stream).await.is_err() {
                    break;
                }
            }
            FrameKind::Data => {
                let sender = streams.lock().get(&frame.stream_id).cloned();
                if let Some(sender) = sender {
                    let _ = sender.send(frame.payload);
                }
            }
            FrameKind::Close => {
                streams.lock().remove(&frame.stream_id);
            }
        }
    }

    debug!("Mux session reader closed");
    closed.cancel();
    streams.lock().clear();
}

#[async_trait]
impl Session for TcpMuxSession {
    async fn open_stream(&self, _cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let id = self.alloc_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().insert(id, tx);

        self.writer_tx.send(MuxFrame::open(id)).map_err(|_| TransportError::Closed)?;

        Ok(Box::new(MuxStream::new(id, rx, self.writer_tx.clone())))
    }

    async fn accept_stream(&self, cancellation: &CancellationToken) -> Result<Box<dyn Stream>, TransportError> {
        let mut guard = self.accept_rx.lock().await;

        tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(TransportError::Cancelled),
            () = self.closed.cancelled() => Err(TransportError::Closed),
            received = guard.recv() => received.map(|stream| Box::new(stream) as Box<dyn Stream>).ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.driver.abort();
        self.writer.abort();
        Ok(())
    }
}

/// One multiplexed sub-stream. Reads are delivered as discrete `Data`-frame
/// payloads off an unbounded channel fed by the session's driver task; a
/// partially-consumed payload is held in `pending` between polls.
pub struct MuxStream {
    id: u32,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Option<Bytes>,
    writer_tx: mpsc::UnboundedSender<MuxFrame>,
    shutdown_sent: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl MuxStream {
    fn new(id: u32, rx: mpsc::UnboundedReceiver<Bytes>, writer_tx: mpsc::UnboundedSender<MuxFrame>) -> Self {
        Self {
            id,
            rx,
            pending: None,
            writer_tx,
            shutdown_sent: false,
            read_deadline: None,
            write_deadline: None,
            read_sleep: None,
        }
    }

    fn deadline_elapsed(deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Polls the read deadline's timer, arming it in `self.read_sleep` on
    /// first use so a read left pending while idle is woken once the
    /// deadline elapses, not merely rejected on the next unrelated poll.
    fn poll_read_deadline(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let me = self.get_mut();
        let Some(deadline) = me.read_deadline else {
            me.read_sleep = None;
            return Poll::Pending;
        };

        let sleep = me.read_sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))));
        sleep.as_mut().poll(cx)
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.as_mut().poll_read_deadline(cx).is_ready() {
            return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline elapsed")));
        }

        if let Some(chunk) = self.pending.take() {
            let take = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..take]);
            if take < chunk.len() {
                self.pending = Some(chunk.slice(take..));
            }
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                let take = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..take]);
                if take < chunk.len() {
                    self.pending = Some(chunk.slice(take..));
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())), // EOF
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if Self::deadline_elapsed(self.write_deadline) {
            return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline elapsed")));
        }

        let frame = MuxFrame::data(self.id, Bytes::copy_from_slice(buf));
        match self.writer_tx.send(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mux session writer is gone"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if !self.shutdown_sent {
            self.shutdown_sent = true;
            let _ = self.writer_tx.send(MuxFrame::close(self.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Stream for MuxStream {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.read_sleep = None;
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.shutdown_sent {
            let _ = self.writer_tx.send(MuxFrame::close(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn connected_pair() -> (Arc<TcpMuxSession>, Arc<TcpMuxSession>) {
        let (client_io, host_io) = tokio::io::duplex(64 * 1024);
        let client = TcpMuxSession::new(client_io, MuxRole::Initiator);
        let host = TcpMuxSession::new(host_io, MuxRole::Acceptor);
        (client, host)
    }

    #[tokio::test]
    async fn open_and_accept_round_trip() {
        let (client, host) = connected_pair();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { host.accept_stream(&CancellationToken::new()).await });

        let mut opened = client.open_stream(&no_cancel).await.unwrap();
        opened.write_all(b"Hello, Portal!").await.unwrap();

        let mut accepted = accept.await.unwrap().unwrap();
        let mut buf = vec![0u8; 14];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello, Portal!");
    }

    #[tokio::test]
    async fn closing_a_stream_is_observed_as_eof_by_the_peer() {
        let (client, host) = connected_pair();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { host.accept_stream(&CancellationToken::new()).await });

        let mut opened = client.open_stream(&no_cancel).await.unwrap();
        opened.shutdown().await.unwrap();

        let mut accepted = accept.await.unwrap().unwrap();
        let mut buf = Vec::new();
        let n = accepted.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn independent_streams_do_not_cross_talk() {
        let (client, host) = connected_pair();
        let no_cancel = CancellationToken::new();

        let mut first = client.open_stream(&no_cancel).await.unwrap();
        let mut second = client.open_stream(&no_cancel).await.unwrap();

        let mut first_accepted = host.accept_stream(&no_cancel).await.unwrap();
        let mut second_accepted = host.accept_stream(&no_cancel).await.unwrap();

        first.write_all(b"first").await.unwrap();
        second.write_all(b"second").await.unwrap();

        let mut first_buf = vec![0u8; 5];
        first_accepted.read_exact(&mut first_buf).await.unwrap();
        assert_eq!(&first_buf, b"first");

        let mut second_buf = vec![0u8; 6];
        second_accepted.read_exact(&mut second_buf).await.unwrap();
        assert_eq!(&second_buf, b"second");
    }

    #[tokio::test]
    async fn close_unblocks_accept() {
        let (client, host) = connected_pair();

        let accept = tokio::spawn(async move { host.accept_stream(&CancellationToken::new()).await });

        client.close().await.unwrap();

        let err = accept.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
