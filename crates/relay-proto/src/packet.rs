use serde::{Deserialize, Serialize};

/// Response/acceptance codes shared by every request/response packet pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Accepted,
    Rejected,
    InvalidIdentity,
}

/// Discovery-friendly summary of a lease, as returned by `RELAY_INFO_RESPONSE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSummary {
    pub identity: String,
    pub name: Option<String>,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayInfoRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfoResponse {
    pub identity: String,
    pub addresses: Vec<String>,
    pub leases: Vec<LeaseSummary>,
}

/// The lease-update payload carried on the wire: the lease's public fields
/// plus the signature material the engine verifies against `public_key`
/// before handing the lease to the lease manager. `expires_at` is Unix
/// seconds, matching how the rest of the wire format avoids a time library
/// dependency on the wire itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedLease {
    pub identity: String,
    pub public_key: Vec<u8>,
    pub name: Option<String>,
    pub alpn: Vec<String>,
    pub metadata: Option<String>,
    pub reverse_token: String,
    pub expires_at: i64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseUpdateRequest {
    pub lease: SignedLease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseUpdateResponse {
    pub code: ResponseCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseDeleteRequest {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseDeleteResponse {
    pub code: ResponseCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub lease_id: String,
    pub client_identity: String,
    pub app_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub code: ResponseCode,
}

/// The tagged union carried by every frame. Discriminants are fixed by
/// `#[repr]`-equivalent ordering in [`crate::codec`] and must not be
/// reordered once deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    RelayInfoRequest(RelayInfoRequest),
    RelayInfoResponse(RelayInfoResponse),
    LeaseUpdateRequest(LeaseUpdateRequest),
    LeaseUpdateResponse(LeaseUpdateResponse),
    LeaseDeleteRequest(LeaseDeleteRequest),
    LeaseDeleteResponse(LeaseDeleteResponse),
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
}

/// Canonical byte sequence a host signs to authorize a [`SignedLease`] (every
/// field but `signature` itself, in a fixed order with `\0`-separated
/// strings). Verifiers reconstruct the same bytes before checking the
/// signature, so this ordering is part of the wire compatibility surface.
pub fn signing_payload(lease: &SignedLease) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(lease.identity.as_bytes());
    buf.push(0);
    buf.extend_from_slice(lease.name.as_deref().unwrap_or("").as_bytes());
    buf.push(0);
    for proto in &lease.alpn {
        buf.extend_from_slice(proto.as_bytes());
        buf.push(0);
    }
    buf.push(0xFF);
    buf.extend_from_slice(lease.metadata.as_deref().unwrap_or("").as_bytes());
    buf.push(0);
    buf.extend_from_slice(lease.reverse_token.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&lease.expires_at.to_be_bytes());
    buf
}

impl Packet {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Packet::RelayInfoRequest(_) => 1,
            Packet::RelayInfoResponse(_) => 2,
            Packet::LeaseUpdateRequest(_) => 3,
            Packet::LeaseUpdateResponse(_) => 4,
            Packet::LeaseDeleteRequest(_) => 5,
            Packet::LeaseDeleteResponse(_) => 6,
            Packet::ConnectionRequest(_) => 7,
            Packet::ConnectionResponse(_) => 8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::RelayInfoRequest(_) => "RELAY_INFO_REQUEST",
            Packet::RelayInfoResponse(_) => "RELAY_INFO_RESPONSE",
            Packet::LeaseUpdateRequest(_) => "LEASE_UPDATE_REQUEST",
            Packet::LeaseUpdateResponse(_) => "LEASE_UPDATE_RESPONSE",
            Packet::LeaseDeleteRequest(_) => "LEASE_DELETE_REQUEST",
            Packet::LeaseDeleteResponse(_) => "LEASE_DELETE_RESPONSE",
            Packet::ConnectionRequest(_) => "CONNECTION_REQUEST",
            Packet::ConnectionResponse(_) => "CONNECTION_RESPONSE",
        }
    }
}
