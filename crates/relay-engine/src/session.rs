use std::sync::Arc;

use lease_manager::ConnectionId;
use relay_task::ShutdownSignal;
use relay_transport::Session;
use tokio_util::sync::CancellationToken;

use crate::RelayEngine;

/// Accepts sub-streams on `session` until it closes or shutdown fires. Each
/// accepted stream is handed to its own short-lived task — one stream's slow
/// client never stalls another's.
#[instrument(skip_all, fields(connection_id = connection_id.0))]
pub(crate) async fn run_session(engine: Arc<RelayEngine>, connection_id: ConnectionId, session: Arc<dyn Session>, mut shutdown_signal: ShutdownSignal) {
    debug!("Session started");
    let cancellation = CancellationToken::new();

    loop {
        tokio::select! {
            accepted = session.accept_stream(&cancellation) => {
                match accepted {
                    Ok(stream) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(error) = crate::dispatch::handle_stream(engine, connection_id, stream).await {
                                debug!(%error, "Stream handler failed");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
            () = shutdown_signal.wait() => {
                debug!("Shutdown signal received, closing session");
                cancellation.cancel();
                let _ = session.close().await;
                break;
            }
        }
    }

    debug!("Session ended");
}
