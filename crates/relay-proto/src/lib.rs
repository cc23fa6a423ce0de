//! The relay wire protocol: a `u32`-length-prefixed frame carrying a
//! tagged-union [`Packet`]. This crate only knows about bytes and logical
//! fields; it has no notion of leases, sessions, or splices.

mod codec;
mod packet;

pub use codec::{MAX_PACKET_SIZE, PacketCodec, ProtoError};
pub use packet::{
    ConnectionRequest, ConnectionResponse, LeaseDeleteRequest, LeaseDeleteResponse, LeaseSummary, LeaseUpdateRequest, LeaseUpdateResponse,
    Packet, RelayInfoRequest, RelayInfoResponse, ResponseCode, SignedLease, signing_payload,
};
