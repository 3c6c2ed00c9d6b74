//! TCP listener loop
//!
//! Accepts connections and handles each in its own task. Framing is the
//! RFC 1035 two-byte big-endian length prefix in both directions. Frames
//! below the DNS header minimum are a protocol violation that ends the
//! connection without a response.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::RelayContext;
use crate::dns::wire;

/// Run one TCP listener until shutdown
///
/// `shutdown_rx` must be subscribed before this task is spawned so a stop
/// racing the spawn is never missed; the sender is kept for per-connection
/// subscriptions.
pub(super) async fn run(
    listener: TcpListener,
    ctx: RelayContext,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let local = listener.local_addr().ok();
    debug!(addr = ?local, "TCP listener running");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        trace!(peer = %peer, "TCP connection accepted");
                        let ctx = ctx.clone();
                        let conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx, conn_shutdown).await {
                                debug!(peer = %peer, error = %e, "TCP connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "TCP accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(addr = ?local, "TCP listener shutting down");
                break;
            }
        }
    }
}

/// Serve queries on one connection until the peer closes or shutdown
async fn handle_connection(
    mut stream: TcpStream,
    ctx: RelayContext,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    loop {
        let query = tokio::select! {
            result = read_frame(&mut stream) => {
                match result {
                    Ok(Some(query)) => query,
                    // Clean EOF or framing violation: close without a response
                    Ok(None) | Err(_) => return Ok(()),
                }
            }
            _ = shutdown.recv() => return Ok(()),
        };

        ctx.stats.record_received();

        match ctx.relay(&query).await {
            Some(reply) if reply.len() <= wire::MAX_TCP_MESSAGE_SIZE => {
                #[allow(clippy::cast_possible_truncation)]
                let prefix = (reply.len() as u16).to_be_bytes();
                stream.write_all(&prefix).await?;
                stream.write_all(&reply).await?;
                stream.flush().await?;
                ctx.stats.record_answered();
            }
            Some(_) => {
                // Upstream reply cannot be framed; drop the connection
                ctx.stats.record_failed();
                return Ok(());
            }
            None => {
                // Upstream failed; let the client time out and retry
                return Ok(());
            }
        }
    }
}

/// Read one length-prefixed query; `None` on clean EOF
async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(prefix) as usize;
    if len < wire::MIN_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame below header minimum: {len} bytes"),
        ));
    }

    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).await?;
    Ok(Some(query))
}
