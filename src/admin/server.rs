//! Admin TCP listener

use super::CoordinatorDirectory;
use anyhow::Result;
use meshcoord_shared::codec::{self, FrameDecoder};
use meshcoord_shared::AdminEnvelope;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accept admin connections until the listener fails
pub async fn serve(listener: TcpListener, directory: Arc<CoordinatorDirectory>) -> Result<()> {
    info!("admin listening on {}", listener.local_addr()?);

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("admin connection from {}", addr);

        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, addr, directory).await {
                warn!("admin connection {} failed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    directory: Arc<CoordinatorDirectory>,
) -> Result<()> {
    let mut decoder = FrameDecoder::<AdminEnvelope>::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            debug!("admin client disconnected: {}", addr);
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        // Requests on one connection are answered in order
        while let Some(envelope) = decoder.decode_next()? {
            let reply = directory.handle(envelope).await;
            socket.write_all(&codec::encode(&reply)?).await?;
        }
    }
}
