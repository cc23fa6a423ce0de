//! Adapts a raw `tokio::net::TcpStream` to `relay_transport::Stream`, for the
//! reverse-connection listener where no multiplexing applies: the host's
//! control channel *is* the eventual splice half once activated.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use relay_transport::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub struct TcpStreamStream {
    inner: TcpStream,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl TcpStreamStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

fn check_deadline(deadline: Option<Instant>) -> std::io::Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline elapsed")),
        _ => Ok(()),
    }
}

impl AsyncRead for TcpStreamStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if let Err(error) = check_deadline(self.read_deadline) {
            return Poll::Ready(Err(error));
        }
        let me = self.get_mut();
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpStreamStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if let Err(error) = check_deadline(self.write_deadline) {
            return Poll::Ready(Err(error));
        }
        let me = self.get_mut();
        Pin::new(&mut me.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Stream for TcpStreamStream {
    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }
}
