use std::sync::Arc;

use bytes::BytesMut;
use lease_manager::ConnectionId;
use relay_identity::Identity;
use relay_proto::{
    ConnectionRequest, ConnectionResponse, LeaseDeleteRequest, LeaseDeleteResponse, LeaseSummary, LeaseUpdateRequest, LeaseUpdateResponse,
    Packet, PacketCodec, ProtoError, RelayInfoResponse, ResponseCode,
};
use relay_transport::Stream;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::RelayEngine;

const READ_CHUNK: usize = 4096;

/// Accumulates bytes off `stream` until [`PacketCodec`] can decode a full
/// frame. Mirrors `read_jet_message`'s read-until-enough-bytes loop, but
/// generalized to the length-prefixed `Packet` framing instead of a
/// fixed-size header plus declared body length.
async fn read_one_packet(stream: &mut Box<dyn Stream>) -> Result<Packet, ProtoError> {
    let mut codec = PacketCodec;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if let Some(packet) = codec.decode(&mut buf)? {
            return Ok(packet);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtoError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed before a full packet arrived",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_one_packet(stream: &mut Box<dyn Stream>, packet: Packet) -> Result<(), ProtoError> {
    let mut codec = PacketCodec;
    let mut buf = BytesMut::new();
    codec.encode(packet, &mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Reads exactly one packet off a freshly-accepted sub-stream and dispatches
/// it. `RELAY_INFO_REQUEST`/`LEASE_UPDATE_REQUEST`/`LEASE_DELETE_REQUEST`
/// each complete with a single response and the stream is then dropped;
/// `CONNECTION_REQUEST` may instead hijack the stream into a splice.
pub(crate) async fn handle_stream(engine: Arc<RelayEngine>, connection_id: ConnectionId, mut stream: Box<dyn Stream>) -> anyhow::Result<()> {
    let packet = match read_one_packet(&mut stream).await {
        Ok(packet) => packet,
        Err(_) => return Ok(()),
    };

    match packet {
        Packet::RelayInfoRequest(_) => handle_relay_info(&engine, &mut stream).await,
        Packet::LeaseUpdateRequest(request) => handle_lease_update(&engine, connection_id, &mut stream, request).await,
        Packet::LeaseDeleteRequest(request) => handle_lease_delete(&engine, connection_id, &mut stream, request).await,
        Packet::ConnectionRequest(request) => handle_connection_request(&engine, stream, request).await,
        other => {
            debug!(kind = other.type_name(), "Unexpected packet kind on a fresh stream");
            Ok(())
        }
    }
}

async fn handle_relay_info(engine: &Arc<RelayEngine>, stream: &mut Box<dyn Stream>) -> anyhow::Result<()> {
    let leases = engine.lease_manager.get_all().await?;
    let leases = leases
        .into_iter()
        .map(|entry| LeaseSummary {
            identity: entry.lease.identity.as_str().to_owned(),
            name: entry.lease.name.clone(),
            alpn: entry.lease.alpn.clone(),
        })
        .collect();

    let response = RelayInfoResponse {
        identity: engine.config.identity.as_str().to_owned(),
        addresses: engine.config.advertised_addresses.clone(),
        leases,
    };

    write_one_packet(stream, Packet::RelayInfoResponse(response)).await?;
    Ok(())
}

async fn handle_lease_update(
    engine: &Arc<RelayEngine>,
    connection_id: ConnectionId,
    stream: &mut Box<dyn Stream>,
    request: LeaseUpdateRequest,
) -> anyhow::Result<()> {
    let signed = request.lease;
    let identity = Identity::from(signed.identity.as_str());
    let verified = relay_identity::verify(&identity, &signed.public_key, &relay_proto::signing_payload(&signed), &signed.signature);

    let code = if !verified {
        ResponseCode::InvalidIdentity
    } else {
        let expires_at = OffsetDateTime::from_unix_timestamp(signed.expires_at).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let lease = lease_manager::Lease {
            identity: identity.clone(),
            name: signed.name,
            alpn: signed.alpn,
            metadata: signed.metadata,
            reverse_token: signed.reverse_token,
            expires_at,
        };

        match engine.lease_manager.update(lease, connection_id).await? {
            lease_manager::UpdateOutcome::Accepted => {
                // A host re-registering after its lease was dropped (e.g. it
                // expired and the host reconnected) should be reachable via
                // the reverse hub again.
                engine.reverse_hub.clear_dropped(&identity);
                ResponseCode::Accepted
            }
            lease_manager::UpdateOutcome::Rejected => ResponseCode::Rejected,
            lease_manager::UpdateOutcome::Invalid => ResponseCode::InvalidIdentity,
        }
    };

    write_one_packet(stream, Packet::LeaseUpdateResponse(LeaseUpdateResponse { code })).await?;
    Ok(())
}

async fn handle_lease_delete(
    engine: &Arc<RelayEngine>,
    connection_id: ConnectionId,
    stream: &mut Box<dyn Stream>,
    request: LeaseDeleteRequest,
) -> anyhow::Result<()> {
    let identity = Identity::from(request.identity.as_str());

    let code = match engine.lease_manager.delete(identity, connection_id).await? {
        lease_manager::DeleteOutcome::Accepted => ResponseCode::Accepted,
        lease_manager::DeleteOutcome::Invalid => ResponseCode::InvalidIdentity,
    };

    write_one_packet(stream, Packet::LeaseDeleteResponse(LeaseDeleteResponse { code })).await?;
    Ok(())
}

/// Resolves the live path to a lease's host: prefer an already-registered
/// multiplexed session (open a fresh sub-stream on it and forward the
/// request), falling back to the reverse hub's pool of pre-established
/// connections when the host has none.
async fn acquire_host_stream(engine: &Arc<RelayEngine>, entry: &lease_manager::LeaseEntry, request: &ConnectionRequest) -> Result<Box<dyn Stream>, ResponseCode> {
    let live_session = engine.sessions.lock().get(&entry.connection_id).cloned();

    if let Some(session) = live_session {
        let cancellation = tokio_util::sync::CancellationToken::new();
        let mut host_stream = session.open_stream(&cancellation).await.map_err(|_| ResponseCode::Rejected)?;

        let forward = ConnectionRequest {
            lease_id: request.lease_id.clone(),
            client_identity: request.client_identity.clone(),
            app_tag: request.app_tag.clone(),
        };
        write_one_packet(&mut host_stream, Packet::ConnectionRequest(forward))
            .await
            .map_err(|_| ResponseCode::Rejected)?;

        let response = tokio::time::timeout(engine.config.host_round_trip_timeout, read_one_packet(&mut host_stream))
            .await
            .map_err(|_| ResponseCode::Rejected)?
            .map_err(|_| ResponseCode::Rejected)?;

        match response {
            Packet::ConnectionResponse(ConnectionResponse { code: ResponseCode::Accepted }) => Ok(host_stream),
            _ => Err(ResponseCode::Rejected),
        }
    } else {
        engine
            .reverse_hub
            .acquire_for(reverse_hub::Mode::Tls, &entry.lease.identity, engine.config.reverse_acquire_timeout)
            .await
            .map_err(|_| ResponseCode::Rejected)
    }
}

async fn handle_connection_request(engine: &Arc<RelayEngine>, mut client_stream: Box<dyn Stream>, request: ConnectionRequest) -> anyhow::Result<()> {
    let lease_id = Identity::from(request.lease_id.as_str());

    let Some(entry) = engine.lease_manager.get_by_identity(lease_id.clone()).await? else {
        write_one_packet(&mut client_stream, Packet::ConnectionResponse(ConnectionResponse { code: ResponseCode::InvalidIdentity })).await?;
        return Ok(());
    };

    if !entry.lease.alpn.iter().any(|proto| proto == &request.app_tag) {
        write_one_packet(&mut client_stream, Packet::ConnectionResponse(ConnectionResponse { code: ResponseCode::Rejected })).await?;
        return Ok(());
    }

    if engine.limiter.admit(&lease_id).is_err() {
        write_one_packet(&mut client_stream, Packet::ConnectionResponse(ConnectionResponse { code: ResponseCode::Rejected })).await?;
        return Ok(());
    }

    let host_stream = match acquire_host_stream(engine, &entry, &request).await {
        Ok(stream) => stream,
        Err(code) => {
            engine.limiter.release(&lease_id);
            write_one_packet(&mut client_stream, Packet::ConnectionResponse(ConnectionResponse { code })).await?;
            return Ok(());
        }
    };

    if let Err(error) = write_one_packet(&mut client_stream, Packet::ConnectionResponse(ConnectionResponse { code: ResponseCode::Accepted })).await {
        engine.limiter.release(&lease_id);
        return Err(error.into());
    }

    crate::splice::spawn_splice(engine.clone(), lease_id, client_stream, host_stream, None);

    Ok(())
}
