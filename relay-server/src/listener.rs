//! The multiplexed-session listener: every inbound TCP connection becomes a
//! [`relay_mux::TcpMuxSession`] handed to [`RelayEngine::accept_session`].
//! Hosts and clients share this one port; the dispatch engine tells them
//! apart by the first packet on each sub-stream.

use std::net::SocketAddr;
use std::sync::Arc;

use relay_engine::RelayEngine;
use relay_mux::{MuxRole, TcpMuxSession};
use relay_task::ShutdownSignal;
use tokio::net::TcpListener;

/// `shutdown_signal` is shared by every accepted session: broadcasting it
/// once (via the binary's single [`relay_task::ShutdownHandle`]) tells this
/// accept loop to stop and every already-accepted session's loop to close.
pub async fn run(bind_address: SocketAddr, engine: Arc<RelayEngine>, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(%bind_address, "Session listener started");

    loop {
        tokio::select! {
            biased;
            () = shutdown_signal.wait() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "Failed to accept a session connection");
                        continue;
                    }
                };
                debug!(%peer_addr, "Session connection accepted");

                let session = TcpMuxSession::new(stream, MuxRole::Acceptor);
                engine.accept_session(session, shutdown_signal.clone());
            }
        }
    }

    Ok(())
}
