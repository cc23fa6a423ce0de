use std::sync::Arc;
use std::sync::atomic::Ordering;

use relay_identity::Identity;
use relay_transport::{RelayCopyHook, Stream, copy_bidirectional};

use crate::RelayEngine;

/// Spawns the transfer for an admitted `(client, host)` pair, tracks it in
/// `engine.splices` so [`RelayEngine::stop`] can wait for it to drain, and
/// releases the admission slot once the transfer ends either way.
pub(crate) fn spawn_splice(engine: Arc<RelayEngine>, lease_id: Identity, client: Box<dyn Stream>, host: Box<dyn Stream>, hook: Option<RelayCopyHook>) {
    let splice_id = engine.next_splice_id.fetch_add(1, Ordering::Relaxed);

    let engine_for_task = engine.clone();
    let lease_for_task = lease_id.clone();
    let task = relay_task::ChildTask::spawn(async move {
        run_splice(lease_for_task.clone(), client, host, hook).await;
        engine_for_task.limiter.release(&lease_for_task);
        engine_for_task.splices.lock().remove(&splice_id);
    });

    engine.splices.lock().insert(splice_id, task);
}

async fn run_splice(lease_id: Identity, mut client: Box<dyn Stream>, mut host: Box<dyn Stream>, hook: Option<RelayCopyHook>) {
    match hook {
        None => match copy_bidirectional(&mut client, &mut host).await {
            Ok(result) => debug!(%lease_id, a_to_b = result.a_to_b, b_to_a = result.b_to_a, "Splice finished"),
            Err(error) => debug!(%lease_id, %error, "Splice failed"),
        },
        Some(hook) => {
            let (client_read, client_write) = tokio::io::split(client);
            let (host_read, host_write) = tokio::io::split(host);

            let client_to_host = hook(Box::pin(client_read), Box::pin(host_write), "client_to_host");
            let host_to_client = hook(Box::pin(host_read), Box::pin(client_write), "host_to_client");

            let (a, b) = tokio::join!(client_to_host, host_to_client);
            if let Err(error) = a {
                debug!(%lease_id, %error, "client_to_host transfer failed");
            }
            if let Err(error) = b {
                debug!(%lease_id, %error, "host_to_client transfer failed");
            }
        }
    }
}
