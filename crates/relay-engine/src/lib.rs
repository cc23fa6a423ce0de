//! The dispatch engine: registers multiplexed sessions, reads and dispatches
//! packets per sub-stream, brokers `CONNECTION_REQUEST` round trips between
//! clients and hosts, and owns splice admission and lifecycle.
//!
//! State lives behind one `parking_lot::Mutex` per concern — sessions,
//! per-connection tasks, in-flight splices — matching `JetAssociationsMap`'s
//! discipline of never holding a lock across network I/O.

#[macro_use]
extern crate tracing;

mod dispatch;
mod limiter;
mod session;
mod splice;

pub use limiter::AdmissionError;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lease_manager::{ConnectionId, LeaseManagerHandle};
use parking_lot::Mutex;
use relay_identity::Identity;
use relay_task::{ChildTask, ShutdownSignal};
use relay_transport::Session;
use reverse_hub::ReverseHub;
use typed_builder::TypedBuilder;

use limiter::SpliceLimiter;

const DEFAULT_HOST_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REVERSE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_GLOBAL_SPLICE_CAP: usize = 4096;
const DEFAULT_PER_LEASE_SPLICE_CAP: usize = 64;

#[derive(Clone, TypedBuilder)]
pub struct RelayEngineConfig {
    pub identity: Identity,
    #[builder(default)]
    pub advertised_addresses: Vec<String>,
    #[builder(default = Some(DEFAULT_GLOBAL_SPLICE_CAP))]
    pub global_splice_cap: Option<usize>,
    #[builder(default = Some(DEFAULT_PER_LEASE_SPLICE_CAP))]
    pub per_lease_splice_cap: Option<usize>,
    #[builder(default = DEFAULT_HOST_ROUND_TRIP_TIMEOUT)]
    pub host_round_trip_timeout: Duration,
    #[builder(default = DEFAULT_REVERSE_ACQUIRE_TIMEOUT)]
    pub reverse_acquire_timeout: Duration,
}

pub struct RelayEngine {
    config: RelayEngineConfig,
    lease_manager: LeaseManagerHandle,
    reverse_hub: Arc<ReverseHub>,
    sessions: Mutex<HashMap<ConnectionId, Arc<dyn Session>>>,
    session_tasks: Mutex<HashMap<ConnectionId, ChildTask<()>>>,
    splices: Mutex<HashMap<u64, ChildTask<()>>>,
    next_connection_id: AtomicU64,
    next_splice_id: AtomicU64,
    limiter: SpliceLimiter,
}

impl RelayEngine {
    pub fn new(config: RelayEngineConfig, lease_manager: LeaseManagerHandle, reverse_hub: Arc<ReverseHub>) -> Arc<Self> {
        let limiter = SpliceLimiter::new(config.global_splice_cap, config.per_lease_splice_cap);
        Arc::new(Self {
            config,
            lease_manager,
            reverse_hub,
            sessions: Mutex::new(HashMap::new()),
            session_tasks: Mutex::new(HashMap::new()),
            splices: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            next_splice_id: AtomicU64::new(1),
            limiter,
        })
    }

    /// Registers a freshly-established multiplexed session and spawns its
    /// per-stream accept loop. The loop, and the connection's leases, are
    /// torn down when `session` closes or `shutdown_signal` fires.
    ///
    /// Refuses the session once the engine is stopping, returning `None`
    /// without touching `session` further — a session admitted after
    /// `stop()` starts draining would never be joined.
    pub fn accept_session(self: &Arc<Self>, session: Arc<dyn Session>, shutdown_signal: ShutdownSignal) -> Option<ConnectionId> {
        if self.limiter.is_stopping() || shutdown_signal.is_signalled() {
            trace!("Refusing a new session: engine is stopping");
            return None;
        }

        let connection_id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().insert(connection_id, session.clone());

        let engine = self.clone();
        let task = ChildTask::spawn(async move {
            session::run_session(engine.clone(), connection_id, session, shutdown_signal).await;
            engine.sessions.lock().remove(&connection_id);
            // Reverse-hub cleanup for these leases runs through the lease
            // manager's deletion callback, the single path for every
            // destruction cause (explicit delete, TTL expiry, connection
            // teardown) — see the binary's wiring of `DeletionCallback`.
            let _ = engine.lease_manager.cleanup_by_connection(connection_id).await;
        });
        self.session_tasks.lock().insert(connection_id, task);

        Some(connection_id)
    }

    /// Current count of in-flight splices, exposed for metrics/tests.
    pub fn active_splice_count(&self) -> usize {
        self.splices.lock().len()
    }

    /// Stops admitting new splices, then waits for every registered session
    /// loop to unwind and every in-flight splice to finish transferring.
    /// Splices are drained to completion, never aborted — half a copy is
    /// worse than a slow shutdown.
    pub async fn stop(&self) {
        self.limiter.begin_stopping();

        let session_tasks: Vec<_> = self.session_tasks.lock().drain().map(|(_, task)| task).collect();
        for task in session_tasks {
            let _ = task.join().await;
        }

        loop {
            let next_id = { self.splices.lock().keys().next().copied() };
            let Some(id) = next_id else { break };
            if let Some(task) = self.splices.lock().remove(&id) {
                let _ = task.join().await;
            }
        }
    }
}
