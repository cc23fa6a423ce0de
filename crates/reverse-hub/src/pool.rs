use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_transport::Stream;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

const KEEPALIVE_BYTE: u8 = 0x00;

/// Written once, immediately after a connection is enqueued into a lease's
/// pool — distinct from `KEEPALIVE_BYTE` so a host's "you're admitted"
/// signal never waits on the keepalive interval.
const ADMITTED_BYTE: u8 = 0x03;

/// Mode marker written as the last byte before a connection is handed to
/// `acquire_for`'s caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http,
    Tls,
}

impl Mode {
    fn marker(self) -> u8 {
        match self {
            Mode::Http => 0x01,
            Mode::Tls => 0x02,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("lease's pool has been dropped; caller must close the connection")]
    LeaseDropped,
    #[error("failed to write the admission acknowledgement; connection closed")]
    AckFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("no idle connection is available for this lease")]
    NoAvailable,
    #[error("timed out waiting for an idle connection to accept the mode marker")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum HandleConnectError {
    #[error("presented token did not authorize this lease")]
    Unauthorized,
    #[error("lease's pool has been dropped")]
    LeaseDropped,
    #[error("failed to write the admission acknowledgement; connection closed")]
    AckFailed,
}

/// One idle connection sitting in a lease's pool: a stream, a one-shot
/// `done` signal (fired on close/eviction), a one-shot `active` signal
/// (fired on activation), and a write mutex shielding the keepalive byte
/// from racing the mode marker.
pub(crate) struct ReverseConnection {
    stream: Mutex<Option<Box<dyn Stream>>>,
    closed: AtomicBool,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    active_tx: Mutex<Option<oneshot::Sender<()>>>,
    active_rx: Mutex<Option<oneshot::Receiver<()>>>,
    resolved_tx: Mutex<Option<oneshot::Sender<()>>>,
    resolved_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ReverseConnection {
    pub(crate) fn new(stream: Box<dyn Stream>) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        let (active_tx, active_rx) = oneshot::channel();
        let (resolved_tx, resolved_rx) = oneshot::channel();

        Self {
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            active_tx: Mutex::new(Some(active_tx)),
            active_rx: Mutex::new(Some(active_rx)),
            resolved_tx: Mutex::new(Some(resolved_tx)),
            resolved_rx: Mutex::new(Some(resolved_rx)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes the mode marker under `deadline`. On success, fires `active`
    /// (stopping the keepalive task) and hands the stream to the caller. On
    /// failure, closes the connection and reports `Err(())`.
    pub(crate) async fn activate(&self, mode: Mode, deadline: Instant) -> Result<Box<dyn Stream>, ()> {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            drop(guard);
            self.close().await;
            return Err(());
        };

        let write = tokio::time::timeout_at(deadline, stream.write_all(&[mode.marker()])).await;

        match write {
            Ok(Ok(())) => {
                let stream = guard.take().expect("checked Some above");
                drop(guard);
                self.fire_active();
                self.fire_resolved();
                Ok(stream)
            }
            _ => {
                drop(guard);
                self.close().await;
                Err(())
            }
        }
    }

    /// Writes the admission acknowledgement byte. Called once, right after
    /// the connection is enqueued, before the keepalive task is spawned.
    pub(crate) async fn send_admission_ack(&self) -> bool {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else { return false };
        stream.write_all(&[ADMITTED_BYTE]).await.is_ok()
    }

    /// Idempotent: marks the connection closed, shuts down the underlying
    /// stream, and fires both `done` and `resolved`.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }

        self.fire_done();
        self.fire_resolved();
    }

    /// Blocks until this connection leaves the pool, whether by activation
    /// or by close/eviction.
    pub(crate) async fn wait_for_resolution(&self) {
        let rx = self.resolved_rx.lock().await.take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    fn fire_done(&self) {
        if let Ok(mut guard) = self.done_tx.try_lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }

    fn fire_active(&self) {
        if let Ok(mut guard) = self.active_tx.try_lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }

    fn fire_resolved(&self) {
        if let Ok(mut guard) = self.resolved_tx.try_lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn take_lifecycle_receivers(&self) -> (Option<oneshot::Receiver<()>>, Option<oneshot::Receiver<()>>) {
        let done = self.done_rx.lock().await.take();
        let active = self.active_rx.lock().await.take();
        (done, active)
    }
}

/// Writes `0x00` on `connection` every `interval` until `done` or `active`
/// fires. Spawned once per offered connection.
pub(crate) async fn run_idle_keepalive(connection: std::sync::Arc<ReverseConnection>, interval: Duration) {
    let (done_rx, active_rx) = connection.take_lifecycle_receivers().await;
    let Some(done_rx) = done_rx else { return };
    let Some(active_rx) = active_rx else { return };

    tokio::pin!(done_rx);
    tokio::pin!(active_rx);

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; the connection just arrived idle

    loop {
        tokio::select! {
            biased;
            _ = &mut done_rx => break,
            _ = &mut active_rx => break,
            _ = ticker.tick() => {
                let mut guard = connection.stream.lock().await;
                let Some(stream) = guard.as_mut() else { break };
                if stream.write_all(&[KEEPALIVE_BYTE]).await.is_err() {
                    drop(guard);
                    connection.close().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_transport::PipePair;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn activate_writes_mode_marker_before_any_keepalive_byte() {
        let (host, peer) = PipePair::new();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { peer.accept_stream(&CancellationToken::new()).await });
        let idle = host.open_stream(&no_cancel).await.unwrap();
        let mut peer_stream = accept.await.unwrap().unwrap();

        let connection = std::sync::Arc::new(ReverseConnection::new(idle));
        let keepalive = tokio::spawn(run_idle_keepalive(connection.clone(), Duration::from_secs(60)));

        let deadline = Instant::now() + Duration::from_millis(500);
        let _stream = connection.activate(Mode::Tls, deadline).await.unwrap();

        let mut marker = [0u8; 1];
        peer_stream.read_exact(&mut marker).await.unwrap();
        assert_eq!(marker[0], Mode::Tls.marker());

        tokio::time::timeout(Duration::from_millis(200), keepalive).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_marks_connection_closed_and_unblocks_resolution() {
        let (host, peer) = PipePair::new();
        let no_cancel = CancellationToken::new();

        let accept = tokio::spawn(async move { peer.accept_stream(&CancellationToken::new()).await });
        let idle = host.open_stream(&no_cancel).await.unwrap();
        let _peer_stream = accept.await.unwrap().unwrap();

        let connection = std::sync::Arc::new(ReverseConnection::new(idle));
        connection.close().await;

        assert!(connection.is_closed());
        tokio::time::timeout(Duration::from_millis(100), connection.wait_for_resolution())
            .await
            .unwrap();
    }
}
