//! Bootstrap resolution for `DoH` hostnames
//!
//! Resolving a `DoH` endpoint's hostname must not go through the loopback
//! forwarder: before the forwarder is up the query would dead-end, and
//! afterwards it would depend on the very provider being dialed. Candidate
//! addresses are therefore produced in a fixed preference order:
//!
//! 1. the hostname already is an IP literal
//! 2. the provider's own bootstrap IP literals
//! 3. a fixed set of well-known public resolvers, queried over classical
//!    UDP via the host's default route (never loopback); successful results
//!    are cached for the process lifetime
//! 4. the host OS resolver, strictly last
//!
//! TLS verification always runs against the original hostname regardless of
//! which avenue produced the address.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use dashmap::DashMap;
use hickory_proto::rr::RecordType;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::wire;

/// Well-known public resolvers used when a provider ships no bootstrap IPs
pub const PUBLIC_RESOLVERS: [IpAddr; 3] = [
    IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(std::net::Ipv4Addr::new(9, 9, 9, 9)),
];

/// Per-resolver UDP timeout for bootstrap lookups
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Hostname resolver for `DoH` endpoints
///
/// Successful public-resolver lookups are cached in a process-wide map for
/// the lifetime of the resolver. Provider bootstrap literals and IP-literal
/// hostnames bypass the cache entirely.
pub struct BootstrapResolver {
    /// hostname → resolved addresses, process lifetime
    cache: DashMap<String, Vec<IpAddr>>,
}

impl Default for BootstrapResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapResolver {
    /// Create an empty resolver
    #[must_use]
    pub fn new() -> Self {
        Self { cache: DashMap::new() }
    }

    /// Number of cached hostname entries
    #[must_use]
    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }

    /// Produce dial candidates for `host` in preference order
    ///
    /// # Errors
    ///
    /// Returns `DnsError::BootstrapError` when every avenue is exhausted.
    pub async fn resolve(
        &self,
        host: &str,
        provider_bootstraps: &[IpAddr],
    ) -> DnsResult<Vec<IpAddr>> {
        // 1. IP-literal hostname
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        // 2. Provider-supplied bootstrap literals
        if !provider_bootstraps.is_empty() {
            trace!(host, count = provider_bootstraps.len(), "using provider bootstrap IPs");
            return Ok(provider_bootstraps.to_vec());
        }

        // 3. Cached public-resolver result
        if let Some(cached) = self.cache.get(host) {
            trace!(host, "bootstrap cache hit");
            return Ok(cached.clone());
        }

        match self.query_public_resolvers(host).await {
            Ok(ips) if !ips.is_empty() => {
                debug!(host, ips = ?ips, "bootstrap resolved via public resolver");
                self.cache.insert(host.to_string(), ips.clone());
                return Ok(ips);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(host, error = %e, "public resolvers exhausted");
            }
        }

        // 4. Host OS resolver, last resort
        warn!(host, "falling back to the host OS resolver");
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| DnsError::bootstrap(host, format!("OS resolver failed: {e}")))?
            .map(|sa| sa.ip())
            .collect();

        if addrs.is_empty() {
            return Err(DnsError::bootstrap(host, "no address from any avenue"));
        }
        Ok(addrs)
    }

    /// Try each public resolver in order until one answers
    async fn query_public_resolvers(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        let mut last_error = None;

        for resolver in PUBLIC_RESOLVERS {
            let server = SocketAddr::new(resolver, crate::settings::types::DNS_PORT);
            match Self::query_one(server, host).await {
                Ok(ips) if !ips.is_empty() => return Ok(ips),
                Ok(_) => {
                    trace!(host, resolver = %server, "empty answer");
                }
                Err(e) => {
                    trace!(host, resolver = %server, error = %e, "bootstrap lookup failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DnsError::bootstrap(host, "no public resolver returned an answer")
        }))
    }

    /// One classical UDP A lookup against one resolver
    async fn query_one(server: SocketAddr, host: &str) -> DnsResult<Vec<IpAddr>> {
        let query = wire::build_query(host, RecordType::A)?;
        let query_id = wire::message_id(&query);

        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind bootstrap socket", e))?;

        // Connected so stray sources are filtered and unreachable
        // resolvers fail fast instead of burning the whole timeout.
        socket
            .connect(server)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to connect to {server}"), e))?;

        socket
            .send(&query)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to send to {server}"), e))?;

        let mut buf = vec![0u8; wire::MAX_UDP_DATAGRAM_SIZE];
        let len = timeout(BOOTSTRAP_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::timeout(format!("bootstrap query to {server}"), BOOTSTRAP_TIMEOUT))?
            .map_err(|e| DnsError::network_io(format!("recv from {server} failed"), e))?;

        let answer = &buf[..len];
        if wire::message_id(answer) != query_id {
            return Err(DnsError::upstream(server.to_string(), "transaction ID mismatch"));
        }
        if wire::response_code(answer) != Some(wire::RCODE_NO_ERROR) {
            return Err(DnsError::upstream(
                server.to_string(),
                format!("rcode {:?}", wire::response_code(answer)),
            ));
        }

        Ok(wire::parse_ipv4_answers(answer)?
            .into_iter()
            .map(IpAddr::V4)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // ========================================================================
    // Candidate Ordering Tests
    // ========================================================================

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let resolver = BootstrapResolver::new();
        let ips = resolver.resolve("1.1.1.1", &[]).await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]);
        assert_eq!(resolver.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_ipv6_literal_short_circuits() {
        let resolver = BootstrapResolver::new();
        let ips = resolver.resolve("2606:4700:4700::1111", &[]).await.unwrap();
        assert_eq!(ips.len(), 1);
        assert!(ips[0].is_ipv6());
    }

    #[tokio::test]
    async fn test_provider_bootstraps_win_over_everything() {
        let resolver = BootstrapResolver::new();
        let bootstraps = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))];

        let ips = resolver
            .resolve("cloudflare-dns.com", &bootstraps)
            .await
            .unwrap();
        assert_eq!(ips, bootstraps);
        // Literal avenues never populate the cache
        assert_eq!(resolver.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_network() {
        let resolver = BootstrapResolver::new();
        let cached = vec![IpAddr::V4(Ipv4Addr::new(104, 16, 248, 249))];
        resolver.cache.insert("cloudflare-dns.com".into(), cached.clone());

        let ips = resolver.resolve("cloudflare-dns.com", &[]).await.unwrap();
        assert_eq!(ips, cached);
    }

    // ========================================================================
    // Network Tests (require network - marked as ignored)
    // ========================================================================

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_resolve_via_public_resolver() {
        let resolver = BootstrapResolver::new();
        let ips = resolver.resolve("dns.google", &[]).await.unwrap();
        assert!(!ips.is_empty());
        assert_eq!(resolver.cached_hosts(), 1);

        // Second resolution comes from the cache
        let again = resolver.resolve("dns.google", &[]).await.unwrap();
        assert_eq!(again, ips);
    }
}
