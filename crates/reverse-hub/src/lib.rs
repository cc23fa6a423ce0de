//! Per-lease pool of idle, pre-established inbound host connections. Hosts
//! offer connections proactively; the engine acquires one on demand instead
//! of asking the host to dial out fresh on every client request.

#[macro_use]
extern crate tracing;

mod pool;

pub use pool::{AcquireError, HandleConnectError, Mode, OfferError};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use relay_identity::Identity;
use relay_transport::Stream;
use tokio::time::Instant;

use pool::ReverseConnection;

const DEFAULT_POOL_CAPACITY: usize = 64;
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_AUTH_FAILURE_THROTTLE: Duration = Duration::from_secs(2);

/// Invoked at offer time to compare the presented token against the lease's
/// stored secret. Typically wired to the lease manager.
pub type Authorizer = Arc<dyn Fn(Identity, String) -> BoxFuture<'static, bool> + Send + Sync>;

struct Pools {
    by_lease: HashMap<Identity, VecDeque<Arc<ReverseConnection>>>,
    dropped: HashSet<Identity>,
}

/// The hub itself: a lock over the pool index (never held across network
/// I/O) plus the knobs governing pool capacity and timing.
pub struct ReverseHub {
    pools: Mutex<Pools>,
    authorizer: Authorizer,
    capacity: usize,
    keepalive_interval: Duration,
    auth_failure_throttle: Duration,
}

impl ReverseHub {
    pub fn new(authorizer: Authorizer) -> Self {
        Self::builder(authorizer).build()
    }

    pub fn builder(authorizer: Authorizer) -> ReverseHubBuilder {
        ReverseHubBuilder {
            authorizer,
            capacity: DEFAULT_POOL_CAPACITY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            auth_failure_throttle: DEFAULT_AUTH_FAILURE_THROTTLE,
        }
    }

    /// Enqueues `conn` as an idle connection for `lease_id`, writes the
    /// admission acknowledgement, then starts an idle-keepalive task that
    /// writes `0x00` every `keepalive_interval` until `acquire_for`
    /// activates it or it is evicted/dropped.
    pub async fn offer(&self, lease_id: Identity, conn: Box<dyn Stream>) -> Result<(), OfferError> {
        let connection = Arc::new(ReverseConnection::new(conn));

        let evicted = {
            let mut pools = self.pools.lock();

            if pools.dropped.contains(&lease_id) {
                return Err(OfferError::LeaseDropped);
            }

            let pool = pools.by_lease.entry(lease_id.clone()).or_default();

            let evicted = if pool.len() >= self.capacity { pool.pop_front() } else { None };
            pool.push_back(connection.clone());
            evicted
        };

        if let Some(evicted) = evicted {
            tokio::spawn(async move { evicted.close().await });
        }

        if !connection.send_admission_ack().await {
            connection.close().await;
            return Err(OfferError::AckFailed);
        }

        tokio::spawn(pool::run_idle_keepalive(connection, self.keepalive_interval));

        Ok(())
    }

    /// Pops entries from `lease_id`'s pool until one accepts the mode
    /// marker, or `timeout` elapses.
    pub async fn acquire_for(&self, mode: Mode, lease_id: &Identity, timeout: Duration) -> Result<Box<dyn Stream>, AcquireError> {
        let deadline = Instant::now() + timeout;

        loop {
            let candidate = {
                let mut pools = self.pools.lock();
                match pools.by_lease.get_mut(lease_id) {
                    Some(pool) => pool.pop_front(),
                    None => return Err(AcquireError::NoAvailable),
                }
            };

            let Some(candidate) = candidate else {
                return Err(AcquireError::NoAvailable);
            };

            if candidate.is_closed() {
                continue;
            }

            if Instant::now() >= deadline {
                tokio::spawn(async move { candidate.close().await });
                return Err(AcquireError::Timeout);
            }

            match candidate.activate(mode, deadline).await {
                Ok(stream) => return Ok(stream),
                Err(()) => continue,
            }
        }
    }

    /// Moves `lease_id`'s pool into the dropped set, draining and closing
    /// every entry. Invoked from the lease manager's deletion callback.
    pub async fn drop_lease(&self, lease_id: &Identity) {
        let drained = {
            let mut pools = self.pools.lock();
            pools.dropped.insert(lease_id.clone());
            pools.by_lease.remove(lease_id).unwrap_or_default()
        };

        for connection in drained {
            connection.close().await;
        }
    }

    /// Removes `lease_id` from the dropped set; used when a lease is re-registered.
    pub fn clear_dropped(&self, lease_id: &Identity) {
        self.pools.lock().dropped.remove(lease_id);
    }

    /// Parses (already-extracted) `lease_id`/`token` from an inbound
    /// reverse-connection upgrade, authorizes it, and offers it to the pool
    /// on success — writing the admission acknowledgement immediately, well
    /// ahead of the first periodic keepalive byte. Blocks until the
    /// connection leaves the pool, whether by activation or by
    /// closure/eviction.
    pub async fn handle_connect(&self, lease_id: Identity, token: String, conn: Box<dyn Stream>) -> Result<(), HandleConnectError> {
        if !(self.authorizer)(lease_id.clone(), token).await {
            tokio::time::sleep(self.auth_failure_throttle).await;
            drop(conn);
            return Err(HandleConnectError::Unauthorized);
        }

        let connection = Arc::new(ReverseConnection::new(conn));

        let evicted = {
            let mut pools = self.pools.lock();

            if pools.dropped.contains(&lease_id) {
                return Err(HandleConnectError::LeaseDropped);
            }

            let pool = pools.by_lease.entry(lease_id).or_default();
            let evicted = if pool.len() >= self.capacity { pool.pop_front() } else { None };
            pool.push_back(connection.clone());
            evicted
        };

        if let Some(evicted) = evicted {
            tokio::spawn(async move { evicted.close().await });
        }

        if !connection.send_admission_ack().await {
            connection.close().await;
            return Err(HandleConnectError::AckFailed);
        }

        tokio::spawn(pool::run_idle_keepalive(connection.clone(), self.keepalive_interval));

        connection.wait_for_resolution().await;

        Ok(())
    }
}

pub struct ReverseHubBuilder {
    authorizer: Authorizer,
    capacity: usize,
    keepalive_interval: Duration,
    auth_failure_throttle: Duration,
}

impl ReverseHubBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn auth_failure_throttle(mut self, throttle: Duration) -> Self {
        self.auth_failure_throttle = throttle;
        self
    }

    pub fn build(self) -> ReverseHub {
        ReverseHub {
            pools: Mutex::new(Pools {
                by_lease: HashMap::new(),
                dropped: HashSet::new(),
            }),
            authorizer: self.authorizer,
            capacity: self.capacity,
            keepalive_interval: self.keepalive_interval,
            auth_failure_throttle: self.auth_failure_throttle,
        }
    }
}
