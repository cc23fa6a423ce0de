//! The reverse-connection listener: hosts dial in on a plain TCP connection,
//! present `lease_id`/`token` on a small length-prefixed control header, and
//! the connection is handed to the [`ReverseHub`]'s idle pool, which writes
//! an admission acknowledgement byte back immediately (well ahead of the
//! first periodic `0x00` keepalive write).

use std::net::SocketAddr;
use std::sync::Arc;

use relay_identity::Identity;
use relay_task::ShutdownSignal;
use reverse_hub::ReverseHub;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::net::TcpStreamStream;

const MAX_FIELD_LEN: usize = 4096;

async fn read_length_prefixed_field(stream: &mut TcpStream) -> std::io::Result<String> {
    let len = stream.read_u16().await? as usize;
    if len > MAX_FIELD_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "control field too large"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "control field is not valid UTF-8"))
}

async fn handle_connection(mut stream: TcpStream, reverse_hub: Arc<ReverseHub>) {
    let lease_id = match read_length_prefixed_field(&mut stream).await {
        Ok(value) => Identity::from(value.as_str()),
        Err(error) => {
            debug!(%error, "Reverse connection control header read failed");
            return;
        }
    };

    let token = match read_length_prefixed_field(&mut stream).await {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "Reverse connection control header read failed");
            return;
        }
    };

    if let Err(error) = reverse_hub.handle_connect(lease_id, token, Box::new(TcpStreamStream::new(stream))).await {
        debug!(%error, "Reverse connection rejected");
    }
}

pub async fn run(bind_address: SocketAddr, reverse_hub: Arc<ReverseHub>, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(%bind_address, "Reverse-connection listener started");

    loop {
        tokio::select! {
            biased;
            () = shutdown_signal.wait() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "Failed to accept a reverse connection");
                        continue;
                    }
                };
                debug!(%peer_addr, "Reverse connection accepted");
                let reverse_hub = reverse_hub.clone();
                tokio::spawn(handle_connection(stream, reverse_hub));
            }
        }
    }

    Ok(())
}
