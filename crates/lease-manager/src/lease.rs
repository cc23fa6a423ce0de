use relay_identity::Identity;
use time::OffsetDateTime;

/// Sentinel name meaning "unnamed"; distinct leases may share it freely.
pub const UNNAMED_SENTINEL: &str = "(unnamed)";

/// The opaque handle the engine assigns to a session; a lease's
/// `connection_id` records which session currently owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// The record a host publishes to make a service discoverable and connectable.
#[derive(Debug, Clone)]
pub struct Lease {
    pub identity: Identity,
    pub name: Option<String>,
    pub alpn: Vec<String>,
    pub metadata: Option<String>,
    pub reverse_token: String,
    pub expires_at: OffsetDateTime,
}

impl Lease {
    /// Whether `name` participates in uniqueness: non-empty and not the sentinel.
    pub(crate) fn named(&self) -> Option<&str> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() && name != UNNAMED_SENTINEL => Some(name),
            _ => None,
        }
    }
}

/// Internal wrapper held by the registry: a [`Lease`] plus bookkeeping.
#[derive(Debug, Clone)]
pub struct LeaseEntry {
    pub lease: Lease,
    pub connection_id: ConnectionId,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub parsed_metadata: Option<serde_json::Value>,
}

impl LeaseEntry {
    pub(crate) fn is_visible(&self, now: OffsetDateTime, banned: &std::collections::HashSet<Identity>) -> bool {
        now < self.lease.expires_at && !banned.contains(&self.lease.identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    Rejected,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Accepted,
    Invalid,
}
