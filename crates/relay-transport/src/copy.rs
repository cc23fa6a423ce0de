//! Splice copy path. Forked from `tokio::io::copy_bidirectional` (see
//! <https://github.com/tokio-rs/tokio/blob/master/tokio/src/io/util/copy.rs>)
//! to accept an injectable per-direction hook, used by the engine to apply
//! per-lease rate limiting without this crate knowing anything about leases.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const DEFAULT_BUF_SIZE: usize = 8 * 1024;

struct CopyBuffer {
    read_done: bool,
    need_flush: bool,
    pos: usize,
    cap: usize,
    amt: u64,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new() -> Self {
        Self {
            read_done: false,
            need_flush: false,
            pos: 0,
            cap: 0,
            amt: 0,
            buf: vec![0; DEFAULT_BUF_SIZE].into_boxed_slice(),
        }
    }

    fn poll_fill_buf<R>(&mut self, cx: &mut Context<'_>, reader: Pin<&mut R>) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
    {
        let me = &mut *self;
        let mut buf = ReadBuf::new(&mut me.buf);
        buf.set_filled(me.cap);

        let res = reader.poll_read(cx, &mut buf);
        if let Poll::Ready(Ok(())) = res {
            let filled_len = buf.filled().len();
            me.read_done = me.cap == filled_len;
            me.cap = filled_len;
        }
        res
    }

    fn poll_write_buf<R, W>(&mut self, cx: &mut Context<'_>, mut reader: Pin<&mut R>, mut writer: Pin<&mut W>) -> Poll<io::Result<usize>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        let me = &mut *self;
        match writer.as_mut().poll_write(cx, &me.buf[me.pos..me.cap]) {
            Poll::Pending => {
                if !me.read_done && me.cap < me.buf.len() {
                    ready!(me.poll_fill_buf(cx, reader.as_mut()))?;
                }
                Poll::Pending
            }
            res => res,
        }
    }

    /// Returns `Ready(Ok(()))` once EOF has been observed *and* fully flushed downstream.
    fn poll_copy<R, W>(&mut self, cx: &mut Context<'_>, mut reader: Pin<&mut R>, mut writer: Pin<&mut W>) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos == self.cap && !self.read_done {
                self.pos = 0;
                self.cap = 0;

                match self.poll_fill_buf(cx, reader.as_mut()) {
                    Poll::Ready(Ok(())) => (),
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {
                        if self.need_flush {
                            ready!(writer.as_mut().poll_flush(cx))?;
                            self.need_flush = false;
                        }
                        return Poll::Pending;
                    }
                }
            }

            while self.pos < self.cap {
                let i = ready!(self.poll_write_buf(cx, reader.as_mut(), writer.as_mut()))?;
                if i == 0 {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "write zero byte into writer")));
                }
                self.pos += i;
                self.amt += i as u64;
                self.need_flush = true;
            }

            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown(u64),
    Done(u64),
}

/// Drives one direction of the splice: copy until EOF, then shut down the
/// destination writer (half-close propagation), then report done.
fn poll_transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    mut r: Pin<&mut A>,
    mut w: Pin<&mut B>,
) -> Poll<io::Result<u64>>
where
    A: AsyncRead + ?Sized,
    B: AsyncWrite + ?Sized,
{
    loop {
        match state {
            TransferState::Running(buf) => {
                let amt = ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()));
                if let Err(e) = amt {
                    return Poll::Ready(Err(e));
                }
                *state = TransferState::ShuttingDown(buf.amt);
            }
            TransferState::ShuttingDown(amt) => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done(*amt);
            }
            TransferState::Done(amt) => return Poll::Ready(Ok(*amt)),
        }
    }
}

pub struct CopyBidirectionalResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<CopyBidirectionalResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();

        let a_to_b = poll_transfer_one_direction(cx, &mut me.a_to_b, Pin::new(&mut *me.a), Pin::new(&mut *me.b));
        let b_to_a = poll_transfer_one_direction(cx, &mut me.b_to_a, Pin::new(&mut *me.b), Pin::new(&mut *me.a));

        let a_to_b = ready_or_pending(a_to_b)?;
        let b_to_a = ready_or_pending(b_to_a)?;

        match (a_to_b, b_to_a) {
            (Some(a_to_b), Some(b_to_a)) => Poll::Ready(Ok(CopyBidirectionalResult { a_to_b, b_to_a })),
            _ => Poll::Pending,
        }
    }
}

fn ready_or_pending(poll: Poll<io::Result<u64>>) -> io::Result<Option<u64>> {
    match poll {
        Poll::Ready(Ok(amt)) => Ok(Some(amt)),
        Poll::Ready(Err(e)) => Err(e),
        Poll::Pending => Ok(None),
    }
}

/// Splices `a` and `b`: copies concurrently in both directions until both
/// sides have observed EOF (or one side errors), propagating half-close so
/// that a one-sided EOF eventually drains and terminates the other
/// direction rather than leaking a half-open pair.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<CopyBidirectionalResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    CopyBidirectional {
        a,
        b,
        a_to_b: TransferState::Running(CopyBuffer::new()),
        b_to_a: TransferState::Running(CopyBuffer::new()),
    }
    .await
}

/// Per-direction hook invoked in place of the plain buffered copy, e.g. to
/// wrap the copy in a token-bucket rate limiter. `label` identifies the
/// direction for logging (`"client->host"` / `"host->client"`).
pub type RelayCopyHook = Arc<
    dyn Fn(
            Pin<Box<dyn AsyncRead + Send + Unpin>>,
            Pin<Box<dyn AsyncWrite + Send + Unpin>>,
            &'static str,
        ) -> Pin<Box<dyn Future<Output = io::Result<u64>> + Send>>
        + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn echoes_until_both_sides_close() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut host, mut host_peer) = duplex(64);

        let splice = tokio::spawn(async move { copy_bidirectional(&mut client_peer, &mut host_peer).await });

        client.write_all(b"Hello, Portal!").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = vec![0u8; 14];
        host.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"Hello, Portal!");

        host.write_all(b"Hello, Portal!").await.unwrap();
        host.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"Hello, Portal!");

        let result = splice.await.unwrap().unwrap();
        assert_eq!(result.a_to_b, 14);
        assert_eq!(result.b_to_a, 14);
    }
}
