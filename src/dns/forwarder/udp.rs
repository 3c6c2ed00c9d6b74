//! UDP listener loop
//!
//! Reads datagrams and spawns a detached task per query so the receive loop
//! is never blocked by a slow upstream. Replies go back to the originating
//! endpoint; failures drop the datagram (the client retries per protocol).

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::RelayContext;
use crate::dns::wire;

/// Run one UDP listener until shutdown
pub(super) async fn run(
    socket: Arc<UdpSocket>,
    ctx: RelayContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = socket.local_addr().ok();
    debug!(addr = ?local, "UDP listener running");

    let mut buf = vec![0u8; wire::MAX_UDP_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, peer) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "UDP recv failed");
                        continue;
                    }
                };

                if len < wire::MIN_MESSAGE_SIZE {
                    trace!(peer = %peer, len, "runt datagram dropped");
                    continue;
                }

                ctx.stats.record_received();
                let query = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let ctx = ctx.clone();

                tokio::spawn(async move {
                    if let Some(reply) = ctx.relay(&query).await {
                        match socket.send_to(&reply, peer).await {
                            Ok(_) => ctx.stats.record_answered(),
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "UDP reply failed");
                                ctx.stats.record_failed();
                            }
                        }
                    }
                });
            }
            _ = shutdown.recv() => {
                debug!(addr = ?local, "UDP listener shutting down");
                break;
            }
        }
    }
}
