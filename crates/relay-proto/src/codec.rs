use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{
    ConnectionRequest, ConnectionResponse, LeaseDeleteRequest, LeaseDeleteResponse, LeaseUpdateRequest, LeaseUpdateResponse, Packet,
    RelayInfoRequest, RelayInfoResponse,
};

/// `length ≤ 2²⁶` (64 MiB); bit-exact part of the compatibility surface.
pub const MAX_PACKET_SIZE: u32 = 1 << 26;

const HEADER_SIZE: usize = 4;
const MAX_RESERVE_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("packet of {0} bytes exceeds the {MAX_PACKET_SIZE} byte ceiling")]
    TooLarge(u32),
    #[error("malformed packet: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` [`Decoder`]/[`Encoder`] for [`Packet`], framed as
/// `u32 big-endian length ∥ tag byte ∥ json payload`.
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes(src[..HEADER_SIZE].try_into().expect("checked length above"));

        if length > MAX_PACKET_SIZE {
            return Err(ProtoError::TooLarge(length));
        }

        let length = length as usize;

        if src.len() < HEADER_SIZE + length {
            let additional = (HEADER_SIZE + length - src.len()).min(MAX_RESERVE_CHUNK);
            src.reserve(additional);
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let mut frame = src.split_to(length);

        if frame.is_empty() {
            return Err(ProtoError::UnknownTag(0));
        }

        let tag = frame[0];
        frame.advance(1);

        let packet = decode_body(tag, &frame)?;
        Ok(Some(packet))
    }
}

fn decode_body(tag: u8, body: &[u8]) -> Result<Packet, ProtoError> {
    Ok(match tag {
        1 => Packet::RelayInfoRequest(serde_json::from_slice::<RelayInfoRequest>(body)?),
        2 => Packet::RelayInfoResponse(serde_json::from_slice::<RelayInfoResponse>(body)?),
        3 => Packet::LeaseUpdateRequest(serde_json::from_slice::<LeaseUpdateRequest>(body)?),
        4 => Packet::LeaseUpdateResponse(serde_json::from_slice::<LeaseUpdateResponse>(body)?),
        5 => Packet::LeaseDeleteRequest(serde_json::from_slice::<LeaseDeleteRequest>(body)?),
        6 => Packet::LeaseDeleteResponse(serde_json::from_slice::<LeaseDeleteResponse>(body)?),
        7 => Packet::ConnectionRequest(serde_json::from_slice::<ConnectionRequest>(body)?),
        8 => Packet::ConnectionResponse(serde_json::from_slice::<ConnectionResponse>(body)?),
        other => return Err(ProtoError::UnknownTag(other)),
    })
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = item.tag();
        let body = match &item {
            Packet::RelayInfoRequest(p) => serde_json::to_vec(p),
            Packet::RelayInfoResponse(p) => serde_json::to_vec(p),
            Packet::LeaseUpdateRequest(p) => serde_json::to_vec(p),
            Packet::LeaseUpdateResponse(p) => serde_json::to_vec(p),
            Packet::LeaseDeleteRequest(p) => serde_json::to_vec(p),
            Packet::LeaseDeleteResponse(p) => serde_json::to_vec(p),
            Packet::ConnectionRequest(p) => serde_json::to_vec(p),
            Packet::ConnectionResponse(p) => serde_json::to_vec(p),
        }?;

        let length = 1 + body.len();
        let length_u32 = u32::try_from(length).map_err(|_| ProtoError::TooLarge(u32::MAX))?;
        if length_u32 > MAX_PACKET_SIZE {
            return Err(ProtoError::TooLarge(length_u32));
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32(length_u32);
        dst.put_u8(tag);
        dst.extend_from_slice(&body);

        Ok(())
    }
}
