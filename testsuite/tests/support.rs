//! Shared harness for the end-to-end scenario tests: wires a real
//! `RelayEngine` together with a live lease manager and reverse hub, then
//! hands each scenario an in-memory [`PipePair`] to drive exactly the wire
//! protocol a real host or client would speak over a multiplexed TCP
//! connection.

use std::sync::Arc;

use bytes::BytesMut;
use lease_manager::{LeaseManagerHandle, LeaseManagerTask};
use rand::rngs::OsRng;
use relay_engine::{RelayEngine, RelayEngineConfig};
use relay_identity::{Credential as _, Ed25519Credential, Identity};
use relay_proto::{Packet, PacketCodec, ResponseCode, SignedLease};
use relay_task::{ChildTask, ShutdownHandle, ShutdownSignal, spawn_task};
use relay_transport::{PipePair, Session, Stream};
use reverse_hub::ReverseHub;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

pub struct TestRelay {
    pub engine: Arc<RelayEngine>,
    pub lease_manager: LeaseManagerHandle,
    pub reverse_hub: Arc<ReverseHub>,
    shutdown_signal: ShutdownSignal,
    shutdown_handle: ShutdownHandle,
    _lease_manager_task: ChildTask<anyhow::Result<()>>,
}

impl TestRelay {
    pub fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        let lease_manager_task = LeaseManagerTask::new(None);
        let lease_manager = lease_manager_task.handle();
        let lease_manager_task_handle = spawn_task(lease_manager_task, shutdown_signal.clone());

        let authorizer_lease_manager = lease_manager.clone();
        let authorizer: reverse_hub::Authorizer = Arc::new(move |identity: Identity, token: String| {
            let lease_manager = authorizer_lease_manager.clone();
            Box::pin(async move {
                match lease_manager.get_by_identity(identity).await {
                    Ok(Some(entry)) => relay_identity::constant_time_eq(entry.lease.reverse_token.as_bytes(), token.as_bytes()),
                    _ => false,
                }
            })
        });
        let reverse_hub = Arc::new(ReverseHub::new(authorizer));

        let relay_credential = Ed25519Credential::generate(&mut OsRng);
        let engine_config = RelayEngineConfig::builder().identity(relay_credential.id().clone()).build();
        let engine = RelayEngine::new(engine_config, lease_manager.clone(), reverse_hub.clone());

        Self {
            engine,
            lease_manager,
            reverse_hub,
            shutdown_signal,
            shutdown_handle,
            _lease_manager_task: lease_manager_task_handle,
        }
    }

    /// Connects a fresh in-memory session to the engine, exactly as a real
    /// multiplexer would on accepting a TCP connection, and returns the peer
    /// side a scenario drives as "the host" or "the client".
    pub fn connect(&self) -> Arc<dyn Session> {
        let (engine_side, peer_side) = PipePair::new();
        self.engine.accept_session(Arc::new(engine_side), self.shutdown_signal.clone());
        Arc::new(peer_side)
    }

    /// Broadcasts shutdown to every session this harness has accepted, as the
    /// binary does once it decides to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown_handle.signal();
    }

    /// The signal `connect()` hands to the engine, exposed so a scenario can
    /// drive `RelayEngine::accept_session` directly.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown_signal.clone()
    }
}

pub async fn read_packet(stream: &mut Box<dyn Stream>) -> Packet {
    let mut codec = PacketCodec;
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if let Some(packet) = codec.decode(&mut buf).expect("well-formed packet") {
            return packet;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.expect("stream readable");
        assert_ne!(n, 0, "stream closed before a full packet arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub async fn write_packet(stream: &mut Box<dyn Stream>, packet: Packet) {
    let mut codec = PacketCodec;
    let mut buf = BytesMut::new();
    codec.encode(packet, &mut buf).expect("encodable packet");
    stream.write_all(&buf).await.expect("stream writable");
}

/// A host's credential plus the lease fields it is about to sign and submit.
pub struct HostLease {
    pub credential: Ed25519Credential,
    pub name: Option<String>,
    pub alpn: Vec<String>,
    pub reverse_token: String,
}

impl HostLease {
    pub fn new(name: Option<&str>, alpn: &[&str]) -> Self {
        Self {
            credential: Ed25519Credential::generate(&mut OsRng),
            name: name.map(ToOwned::to_owned),
            alpn: alpn.iter().map(|s| (*s).to_owned()).collect(),
            reverse_token: "test-reverse-token".to_owned(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.credential.id().clone()
    }

    fn signed(&self) -> SignedLease {
        let expires_at = (OffsetDateTime::now_utc() + time::Duration::seconds(60)).unix_timestamp();
        let mut lease = SignedLease {
            identity: self.credential.id().as_str().to_owned(),
            public_key: self.credential.public_key().to_vec(),
            name: self.name.clone(),
            alpn: self.alpn.clone(),
            metadata: None,
            reverse_token: self.reverse_token.clone(),
            expires_at,
            signature: Vec::new(),
        };
        lease.signature = self.credential.sign(&relay_proto::signing_payload(&lease));
        lease
    }
}

/// Registers `lease` on `session` over a fresh sub-stream and returns the
/// response code, mirroring what a real host does right after connecting.
pub async fn register_lease(session: &Arc<dyn Session>, lease: &HostLease) -> ResponseCode {
    let cancellation = tokio_util::sync::CancellationToken::new();
    let mut stream = session.open_stream(&cancellation).await.expect("open stream");

    write_packet(&mut stream, Packet::LeaseUpdateRequest(relay_proto::LeaseUpdateRequest { lease: lease.signed() })).await;

    match read_packet(&mut stream).await {
        Packet::LeaseUpdateResponse(response) => response.code,
        other => panic!("unexpected response to LEASE_UPDATE_REQUEST: {}", other.type_name()),
    }
}
