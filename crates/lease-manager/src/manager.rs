use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use relay_identity::Identity;
use relay_task::{ShutdownSignal, Task};
use tap::Pipe as _;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::lease::{ConnectionId, DeleteOutcome, Lease, LeaseEntry, UpdateOutcome};

const DEFAULT_TICK_INTERVAL: StdDuration = StdDuration::from_secs(30);
const MANAGER_CHANNEL_CAPACITY: usize = 256;

/// Invoked outside the manager's internal state, once per destroyed lease.
/// Spawned rather than awaited inline so a slow callback never stalls the
/// actor loop (and, transitively, every other pending request).
pub type DeletionCallback = Arc<dyn Fn(Identity) -> BoxFuture<'static, ()> + Send + Sync>;

enum LeaseManagerMessage {
    Update {
        lease: Lease,
        connection_id: ConnectionId,
        channel: oneshot::Sender<UpdateOutcome>,
    },
    Delete {
        identity: Identity,
        connection_id: ConnectionId,
        channel: oneshot::Sender<DeleteOutcome>,
    },
    GetByIdentity {
        identity: Identity,
        channel: oneshot::Sender<Option<LeaseEntry>>,
    },
    GetByName {
        name: String,
        channel: oneshot::Sender<Option<LeaseEntry>>,
    },
    GetByNameCaseInsensitive {
        name: String,
        channel: oneshot::Sender<Option<LeaseEntry>>,
    },
    GetAll {
        channel: oneshot::Sender<Vec<LeaseEntry>>,
    },
    CleanupByConnection {
        connection_id: ConnectionId,
        channel: oneshot::Sender<Vec<Identity>>,
    },
    Ban {
        identity: Identity,
    },
    Unban {
        identity: Identity,
    },
    SetNamePattern {
        pattern: Option<Regex>,
    },
    SetTtlBounds {
        bounds: Option<(TimeDuration, TimeDuration)>,
    },
}

impl fmt::Debug for LeaseManagerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update { lease, connection_id, .. } => f
                .debug_struct("Update")
                .field("identity", &lease.identity)
                .field("connection_id", connection_id)
                .finish_non_exhaustive(),
            Self::Delete {
                identity, connection_id, ..
            } => f
                .debug_struct("Delete")
                .field("identity", identity)
                .field("connection_id", connection_id)
                .finish_non_exhaustive(),
            Self::GetByIdentity { identity, .. } => f.debug_struct("GetByIdentity").field("identity", identity).finish_non_exhaustive(),
            Self::GetByName { name, .. } => f.debug_struct("GetByName").field("name", name).finish_non_exhaustive(),
            Self::GetByNameCaseInsensitive { name, .. } => f
                .debug_struct("GetByNameCaseInsensitive")
                .field("name", name)
                .finish_non_exhaustive(),
            Self::GetAll { .. } => f.debug_struct("GetAll").finish_non_exhaustive(),
            Self::CleanupByConnection { connection_id, .. } => f
                .debug_struct("CleanupByConnection")
                .field("connection_id", connection_id)
                .finish_non_exhaustive(),
            Self::Ban { identity } => f.debug_struct("Ban").field("identity", identity).finish(),
            Self::Unban { identity } => f.debug_struct("Unban").field("identity", identity).finish(),
            Self::SetNamePattern { pattern } => f
                .debug_struct("SetNamePattern")
                .field("pattern", &pattern.as_ref().map(Regex::as_str))
                .finish(),
            Self::SetTtlBounds { bounds } => f.debug_struct("SetTtlBounds").field("bounds", bounds).finish(),
        }
    }
}

/// Cloneable front-end to the lease manager's command loop.
#[derive(Clone)]
pub struct LeaseManagerHandle(mpsc::Sender<LeaseManagerMessage>);

impl LeaseManagerHandle {
    pub async fn update(&self, lease: Lease, connection_id: ConnectionId) -> anyhow::Result<UpdateOutcome> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::Update {
                lease,
                connection_id,
                channel: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn delete(&self, identity: Identity, connection_id: ConnectionId) -> anyhow::Result<DeleteOutcome> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::Delete {
                identity,
                connection_id,
                channel: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn get_by_identity(&self, identity: Identity) -> anyhow::Result<Option<LeaseEntry>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::GetByIdentity { identity, channel: tx })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn get_by_name(&self, name: String) -> anyhow::Result<Option<LeaseEntry>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::GetByName { name, channel: tx })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn get_by_name_case_insensitive(&self, name: String) -> anyhow::Result<Option<LeaseEntry>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::GetByNameCaseInsensitive { name, channel: tx })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn get_all(&self) -> anyhow::Result<Vec<LeaseEntry>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::GetAll { channel: tx })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn cleanup_by_connection(&self, connection_id: ConnectionId) -> anyhow::Result<Vec<Identity>> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(LeaseManagerMessage::CleanupByConnection { connection_id, channel: tx })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("lease manager dropped the reply channel"))
    }

    pub async fn ban(&self, identity: Identity) -> anyhow::Result<()> {
        self.0
            .send(LeaseManagerMessage::Ban { identity })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))
    }

    pub async fn unban(&self, identity: Identity) -> anyhow::Result<()> {
        self.0
            .send(LeaseManagerMessage::Unban { identity })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))
    }

    pub async fn set_name_pattern(&self, pattern: Option<Regex>) -> anyhow::Result<()> {
        self.0
            .send(LeaseManagerMessage::SetNamePattern { pattern })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))
    }

    pub async fn set_ttl_bounds(&self, bounds: Option<(TimeDuration, TimeDuration)>) -> anyhow::Result<()> {
        self.0
            .send(LeaseManagerMessage::SetTtlBounds { bounds })
            .await
            .map_err(|_| anyhow::anyhow!("lease manager task is gone"))
    }
}

fn lease_manager_channel() -> (LeaseManagerHandle, mpsc::Receiver<LeaseManagerMessage>) {
    mpsc::channel(MANAGER_CHANNEL_CAPACITY).pipe(|(tx, rx)| (LeaseManagerHandle(tx), rx))
}

/// The single writer over the lease registry, banned set, and policy knobs.
pub struct LeaseManagerTask {
    tx: LeaseManagerHandle,
    rx: mpsc::Receiver<LeaseManagerMessage>,
    registry: HashMap<Identity, LeaseEntry>,
    banned: HashSet<Identity>,
    name_pattern: Option<Regex>,
    ttl_bounds: Option<(TimeDuration, TimeDuration)>,
    tick_interval: StdDuration,
    deletion_callback: Option<DeletionCallback>,
}

impl LeaseManagerTask {
    pub fn new(deletion_callback: Option<DeletionCallback>) -> Self {
        Self::with_tick_interval(deletion_callback, DEFAULT_TICK_INTERVAL)
    }

    pub fn with_tick_interval(deletion_callback: Option<DeletionCallback>, tick_interval: StdDuration) -> Self {
        let (tx, rx) = lease_manager_channel();
        Self {
            tx,
            rx,
            registry: HashMap::new(),
            banned: HashSet::new(),
            name_pattern: None,
            ttl_bounds: None,
            tick_interval,
            deletion_callback,
        }
    }

    pub fn handle(&self) -> LeaseManagerHandle {
        self.tx.clone()
    }

    fn handle_update(&mut self, lease: Lease, connection_id: ConnectionId) -> UpdateOutcome {
        let now = OffsetDateTime::now_utc();

        if now >= lease.expires_at {
            return UpdateOutcome::Rejected;
        }

        if self.banned.contains(&lease.identity) {
            return UpdateOutcome::Rejected;
        }

        if let (Some(pattern), Some(name)) = (&self.name_pattern, lease.named()) {
            if !pattern.is_match(name) {
                return UpdateOutcome::Rejected;
            }
        }

        if let Some((min, max)) = self.ttl_bounds {
            let ttl = lease.expires_at - now;
            if ttl < min || ttl > max {
                return UpdateOutcome::Rejected;
            }
        }

        if let Some(name) = lease.named() {
            let conflict = self
                .registry
                .values()
                .any(|entry| entry.lease.identity != lease.identity && entry.lease.named() == Some(name));
            if conflict {
                return UpdateOutcome::Rejected;
            }
        }

        match self.registry.get(&lease.identity) {
            Some(existing) if existing.connection_id != connection_id => UpdateOutcome::Invalid,
            Some(existing) => {
                let first_seen = existing.first_seen;
                let parsed_metadata = lease.metadata.as_deref().and_then(|raw| serde_json::from_str(raw).ok());
                self.registry.insert(
                    lease.identity.clone(),
                    LeaseEntry {
                        lease,
                        connection_id,
                        first_seen,
                        last_seen: now,
                        parsed_metadata,
                    },
                );
                UpdateOutcome::Accepted
            }
            None => {
                let parsed_metadata = lease.metadata.as_deref().and_then(|raw| serde_json::from_str(raw).ok());
                self.registry.insert(
                    lease.identity.clone(),
                    LeaseEntry {
                        lease,
                        connection_id,
                        first_seen: now,
                        last_seen: now,
                        parsed_metadata,
                    },
                );
                UpdateOutcome::Accepted
            }
        }
    }

    fn handle_delete(&mut self, identity: &Identity, connection_id: ConnectionId) -> (DeleteOutcome, Option<Identity>) {
        match self.registry.get(identity) {
            Some(entry) if entry.connection_id == connection_id => {
                self.registry.remove(identity);
                (DeleteOutcome::Accepted, Some(identity.clone()))
            }
            _ => (DeleteOutcome::Invalid, None),
        }
    }

    fn handle_get_by_identity(&self, identity: &Identity) -> Option<LeaseEntry> {
        let now = OffsetDateTime::now_utc();
        self.registry
            .get(identity)
            .filter(|entry| entry.is_visible(now, &self.banned))
            .cloned()
    }

    fn handle_get_by_name(&self, name: &str) -> Option<LeaseEntry> {
        let now = OffsetDateTime::now_utc();
        self.registry
            .values()
            .filter(|entry| entry.is_visible(now, &self.banned))
            .find(|entry| entry.lease.named() == Some(name))
            .cloned()
    }

    fn handle_get_by_name_case_insensitive(&self, name: &str) -> Option<LeaseEntry> {
        let now = OffsetDateTime::now_utc();
        self.registry
            .values()
            .filter(|entry| entry.is_visible(now, &self.banned))
            .find(|entry| entry.lease.named().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
    }

    fn handle_get_all(&self) -> Vec<LeaseEntry> {
        let now = OffsetDateTime::now_utc();
        self.registry
            .values()
            .filter(|entry| entry.is_visible(now, &self.banned))
            .cloned()
            .collect()
    }

    fn handle_cleanup_by_connection(&mut self, connection_id: ConnectionId) -> Vec<Identity> {
        let removed: Vec<Identity> = self
            .registry
            .iter()
            .filter(|(_, entry)| entry.connection_id == connection_id)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &removed {
            self.registry.remove(identity);
        }

        removed
    }

    fn sweep_expired(&mut self) -> Vec<Identity> {
        let now = OffsetDateTime::now_utc();
        let expired: Vec<Identity> = self
            .registry
            .iter()
            .filter(|(_, entry)| now > entry.lease.expires_at)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &expired {
            self.registry.remove(identity);
        }

        expired
    }

    fn dispatch_deletion(&self, identity: Identity) {
        if let Some(callback) = self.deletion_callback.clone() {
            tokio::spawn(callback(identity));
        }
    }
}

#[async_trait]
impl Task for LeaseManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "lease manager";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        lease_manager_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn lease_manager_task(mut manager: LeaseManagerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let mut tick = tokio::time::interval(manager.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let expired = manager.sweep_expired();
                for identity in expired {
                    debug!(%identity, "Lease expired");
                    manager.dispatch_deletion(identity);
                }
            }
            msg = manager.rx.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };

                trace!(?msg, "Received message");

                match msg {
                    LeaseManagerMessage::Update { lease, connection_id, channel } => {
                        let outcome = manager.handle_update(lease, connection_id);
                        let _ = channel.send(outcome);
                    }
                    LeaseManagerMessage::Delete { identity, connection_id, channel } => {
                        let (outcome, deleted) = manager.handle_delete(&identity, connection_id);
                        let _ = channel.send(outcome);
                        if let Some(identity) = deleted {
                            manager.dispatch_deletion(identity);
                        }
                    }
                    LeaseManagerMessage::GetByIdentity { identity, channel } => {
                        let _ = channel.send(manager.handle_get_by_identity(&identity));
                    }
                    LeaseManagerMessage::GetByName { name, channel } => {
                        let _ = channel.send(manager.handle_get_by_name(&name));
                    }
                    LeaseManagerMessage::GetByNameCaseInsensitive { name, channel } => {
                        let _ = channel.send(manager.handle_get_by_name_case_insensitive(&name));
                    }
                    LeaseManagerMessage::GetAll { channel } => {
                        let _ = channel.send(manager.handle_get_all());
                    }
                    LeaseManagerMessage::CleanupByConnection { connection_id, channel } => {
                        let removed = manager.handle_cleanup_by_connection(connection_id);
                        let _ = channel.send(removed.clone());
                        for identity in removed {
                            manager.dispatch_deletion(identity);
                        }
                    }
                    LeaseManagerMessage::Ban { identity } => {
                        manager.banned.insert(identity);
                    }
                    LeaseManagerMessage::Unban { identity } => {
                        manager.banned.remove(&identity);
                    }
                    LeaseManagerMessage::SetNamePattern { pattern } => {
                        manager.name_pattern = pattern;
                    }
                    LeaseManagerMessage::SetTtlBounds { bounds } => {
                        manager.ttl_bounds = bounds;
                    }
                }
            }
            () = shutdown_signal.wait() => {
                debug!("Shutdown signal received");
                break;
            }
        }
    }

    debug!("Task terminated");

    Ok(())
}
