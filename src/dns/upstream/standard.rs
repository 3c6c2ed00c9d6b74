//! Classical UDP upstream
//!
//! Sends the client's query bytes verbatim to the provider's servers in the
//! fixed order primary IPv4, secondary IPv4, primary IPv6, secondary IPv6.
//! Each candidate gets one datagram and a per-attempt timeout; the first
//! reply wins. Egress is UDP-only; TCP ingress is accepted by the forwarder
//! but relayed over the same UDP path.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::wire;
use crate::settings::Provider;

/// Per-candidate timeout for one UDP attempt
pub const UDP_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for classical UDP providers
///
/// Stateless: each attempt binds a fresh ephemeral socket, so queries never
/// share ports and a poisoned socket cannot outlive one attempt.
#[derive(Debug, Clone)]
pub struct StandardClient {
    /// Timeout for a single candidate attempt
    attempt_timeout: Duration,

    /// Destination port, 53 in production
    ///
    /// Overridable so tests can stand up an upstream on an ephemeral port.
    port: u16,
}

impl Default for StandardClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardClient {
    /// Create a client with the default per-attempt timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt_timeout: UDP_ATTEMPT_TIMEOUT,
            port: crate::settings::types::DNS_PORT,
        }
    }

    /// Create a client with a custom per-attempt timeout
    #[must_use]
    pub fn with_timeout(attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            ..Self::new()
        }
    }

    /// Create a client targeting a non-standard port
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self { port, ..Self::new() }
    }

    /// Relay `query` to the provider, returning the first reply
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` if the provider has no addresses and
    /// `DnsError::UpstreamError` when every candidate failed.
    pub async fn query(&self, provider: &Provider, query: &[u8]) -> DnsResult<Vec<u8>> {
        let candidates = provider.candidate_addrs();
        if candidates.is_empty() {
            return Err(DnsError::config(format!(
                "provider '{}' has no server addresses",
                provider.name
            )));
        }

        let mut last_error = None;
        for mut server in candidates {
            server.set_port(self.port);
            match self.query_once(server, query).await {
                Ok(reply) => {
                    trace!(provider = %provider.name, server = %server, "upstream answered");
                    return Ok(reply);
                }
                Err(e) => {
                    debug!(
                        provider = %provider.name,
                        server = %server,
                        error = %e,
                        "upstream attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DnsError::upstream(&provider.name, "all upstream attempts failed")
        }))
    }

    /// One datagram to one server
    async fn query_once(&self, server: SocketAddr, query: &[u8]) -> DnsResult<Vec<u8>> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind egress socket", e))?;

        // Connecting filters stray sources in the kernel and surfaces ICMP
        // unreachable as an immediate error instead of a full timeout.
        socket
            .connect(server)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to connect to {server}"), e))?;

        socket
            .send(query)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send query to {server}"), e))?;

        let mut buf = vec![0u8; wire::MAX_UDP_DATAGRAM_SIZE];
        let len = timeout(self.attempt_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::timeout(format!("UDP query to {server}"), self.attempt_timeout))?
            .map_err(|e| DnsError::network_io(format!("recv from {server} failed"), e))?;

        // The reply is returned verbatim; only the transaction ID is checked
        // so a stray datagram cannot be handed to the wrong client.
        if wire::message_id(&buf[..len]) != wire::message_id(query) {
            return Err(DnsError::upstream(server.to_string(), "transaction ID mismatch"));
        }

        buf.truncate(len);
        Ok(buf)
    }
}
