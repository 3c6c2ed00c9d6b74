//! Upstream transports
//!
//! One facade, [`UpstreamTransport`], dispatches a query bytestring to the
//! given provider over the transport its variant calls for: classical UDP
//! with ordered failover, or a `DoH` POST. Both paths relay the client's
//! bytes verbatim and return the upstream's bytes verbatim.

pub mod bootstrap;
pub mod doh;
pub mod standard;

use std::sync::Arc;

use uuid::Uuid;

pub use bootstrap::BootstrapResolver;
pub use doh::DohClient;
pub use standard::StandardClient;

use crate::dns::error::DnsResult;
use crate::settings::Provider;

/// Transport facade over the classical and `DoH` paths
///
/// Thread-safe; one instance is shared by the forwarder, the control state
/// machine and the health monitor.
#[derive(Debug)]
pub struct UpstreamTransport {
    standard: StandardClient,
    doh: DohClient,
}

impl Default for UpstreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamTransport {
    /// Create a transport with its own bootstrap resolver
    #[must_use]
    pub fn new() -> Self {
        Self::with_bootstrap(Arc::new(BootstrapResolver::new()))
    }

    /// Create a transport sharing an existing bootstrap resolver
    #[must_use]
    pub fn with_bootstrap(bootstrap: Arc<BootstrapResolver>) -> Self {
        Self {
            standard: StandardClient::new(),
            doh: DohClient::new(bootstrap),
        }
    }

    /// Create a transport whose classical path targets `port` instead of 53
    ///
    /// Useful for tests that stand up an upstream on an ephemeral port.
    #[must_use]
    pub fn with_dns_port(port: u16) -> Self {
        Self {
            standard: StandardClient::with_port(port),
            doh: DohClient::new(Arc::new(BootstrapResolver::new())),
        }
    }

    /// Relay `query` to `provider` and return the response bytes
    pub async fn query(&self, provider: &Provider, query: &[u8]) -> DnsResult<Vec<u8>> {
        if provider.is_doh() {
            self.doh.query(provider, query).await
        } else {
            self.standard.query(provider, query).await
        }
    }

    /// Drop any pooled `DoH` connection for a provider
    ///
    /// Invoked on provider switches so the replacement connection dials with
    /// the incoming provider's bootstrap list.
    pub fn invalidate_doh(&self, provider_id: Uuid) {
        self.doh.invalidate(provider_id);
    }
}
