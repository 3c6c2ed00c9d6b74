//! Loopback DNS forwarder
//!
//! Four concurrent listeners (UDP and TCP, IPv4 and IPv6 loopback) relay
//! wire-format queries to the active provider through the upstream
//! transport. Per-query work runs in detached tasks so a slow upstream
//! never blocks the accept/receive loops.
//!
//! The active provider is published through an atomic snapshot: a switch
//! affects only queries that start after it, while in-flight queries finish
//! against the provider they loaded.
//!
//! # Architecture
//!
//! ```text
//! UDP 127.0.0.1:53 ─┐
//! UDP [::1]:53     ─┤          ┌── per-query task ──▶ transport.query(active)
//! TCP 127.0.0.1:53 ─┼─ spawn ──┤
//! TCP [::1]:53     ─┘          └── reply to originating endpoint
//! ```

mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dns::error::{DnsError, DnsResult};
use crate::dns::upstream::UpstreamTransport;
use crate::settings::Provider;

/// How long `stop` waits for in-flight queries before releasing resources
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while draining in-flight queries
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Listener bind addresses
///
/// Production binds the loopback pair on port 53; tests substitute
/// ephemeral ports.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// IPv4 bind address (UDP and TCP)
    pub bind_v4: SocketAddr,
    /// IPv6 bind address (UDP and TCP)
    pub bind_v6: SocketAddr,
    /// Whether to bind the IPv6 pair at all
    pub bind_ipv6: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            bind_v4: "127.0.0.1:53".parse().expect("literal addr"),
            bind_v6: "[::1]:53".parse().expect("literal addr"),
            bind_ipv6: true,
        }
    }
}

impl ForwarderConfig {
    /// Loopback with OS-assigned ports, IPv4 only (test use)
    #[must_use]
    pub fn ephemeral_v4() -> Self {
        Self {
            bind_v4: "127.0.0.1:0".parse().expect("literal addr"),
            bind_v6: "[::1]:0".parse().expect("literal addr"),
            bind_ipv6: false,
        }
    }
}

/// Counters shared by all listeners
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Queries read off a socket
    received: AtomicU64,
    /// Queries answered back to the client
    answered: AtomicU64,
    /// Queries that failed upstream or could not be written back
    failed: AtomicU64,
}

impl ForwarderStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_answered(&self) {
        self.answered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            answered: self.answered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time forwarder counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwarderStatsSnapshot {
    /// Queries read off a socket
    pub received: u64,
    /// Queries answered back to the client
    pub answered: u64,
    /// Queries that failed
    pub failed: u64,
}

/// State that only exists while the listeners run
struct Running {
    shutdown_tx: broadcast::Sender<()>,
    listeners: Vec<JoinHandle<()>>,
    local_v4: SocketAddr,
    local_v6: Option<SocketAddr>,
}

/// The loopback forwarder
///
/// Owns the loopback sockets between `start` and `stop` and the active
/// provider snapshot for the whole process.
pub struct Forwarder {
    transport: Arc<UpstreamTransport>,
    config: ForwarderConfig,
    active: Arc<ArcSwapOption<Provider>>,
    stats: Arc<ForwarderStats>,
    in_flight: Arc<AtomicU64>,
    running: parking_lot::Mutex<Option<Running>>,
}

impl Forwarder {
    /// Create a stopped forwarder with the default loopback:53 bindings
    #[must_use]
    pub fn new(transport: Arc<UpstreamTransport>) -> Self {
        Self::with_config(transport, ForwarderConfig::default())
    }

    /// Create a stopped forwarder with custom bindings
    #[must_use]
    pub fn with_config(transport: Arc<UpstreamTransport>, config: ForwarderConfig) -> Self {
        Self {
            transport,
            config,
            active: Arc::new(ArcSwapOption::from(None)),
            stats: Arc::new(ForwarderStats::default()),
            in_flight: Arc::new(AtomicU64::new(0)),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Whether the listeners are currently bound
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// The provider new queries will be relayed to
    #[must_use]
    pub fn active_provider(&self) -> Option<Arc<Provider>> {
        self.active.load_full()
    }

    /// Swap the active provider; in-flight queries keep the old snapshot
    pub fn set_active(&self, provider: Arc<Provider>) {
        self.active.store(Some(provider));
    }

    /// Total successfully answered queries since process start
    #[must_use]
    pub fn queries_handled(&self) -> u64 {
        self.stats.snapshot().answered
    }

    /// Listener statistics
    #[must_use]
    pub fn stats(&self) -> ForwarderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bound IPv4 address while running (test use for ephemeral ports)
    #[must_use]
    pub fn local_v4(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_v4)
    }

    /// Bound IPv6 address while running, if the IPv6 pair was requested
    #[must_use]
    pub fn local_v6(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.local_v6)
    }

    /// Bind all sockets and launch the listener tasks
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NetworkError` if any socket cannot be bound; the
    /// message names the conflicting address (port 53 is commonly held by
    /// another resolver). No listener survives a partial bind.
    pub async fn start(&self, provider: Arc<Provider>) -> DnsResult<()> {
        if self.is_running() {
            return Err(DnsError::internal("forwarder already running"));
        }

        let udp_v4 = Self::bind_udp(self.config.bind_v4).await?;
        let tcp_v4 = Self::bind_tcp(self.config.bind_v4).await?;
        let local_v4 = udp_v4
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to read local address", e))?;

        let (udp_v6, tcp_v6, local_v6) = if self.config.bind_ipv6 {
            let udp = Self::bind_udp(self.config.bind_v6).await?;
            let tcp = Self::bind_tcp(self.config.bind_v6).await?;
            let local = udp
                .local_addr()
                .map_err(|e| DnsError::network_io("failed to read local address", e))?;
            (Some(udp), Some(tcp), Some(local))
        } else {
            (None, None, None)
        };

        self.active.store(Some(provider));

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut listeners = Vec::with_capacity(4);

        listeners.push(tokio::spawn(udp::run(
            Arc::new(udp_v4),
            self.relay_context(),
            shutdown_tx.subscribe(),
        )));
        listeners.push(tokio::spawn(tcp::run(
            tcp_v4,
            self.relay_context(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        )));
        if let (Some(udp_sock), Some(tcp_listener)) = (udp_v6, tcp_v6) {
            listeners.push(tokio::spawn(udp::run(
                Arc::new(udp_sock),
                self.relay_context(),
                shutdown_tx.subscribe(),
            )));
            listeners.push(tokio::spawn(tcp::run(
                tcp_listener,
                self.relay_context(),
                shutdown_tx.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        info!(
            v4 = %local_v4,
            v6 = ?local_v6,
            listeners = listeners.len(),
            "forwarder started"
        );

        *self.running.lock() = Some(Running {
            shutdown_tx,
            listeners,
            local_v4,
            local_v6,
        });

        Ok(())
    }

    /// Stop the listeners, drain in-flight queries, release the sockets
    ///
    /// Waits up to [`SHUTDOWN_DRAIN_TIMEOUT`] for per-query tasks, then
    /// abandons them. Idempotent: stopping a stopped forwarder is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        debug!("forwarder stopping");
        let _ = running.shutdown_tx.send(());

        for listener in running.listeners {
            if let Err(e) = listener.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "listener task panicked");
                }
            }
        }

        // Listener sockets are gone; give per-query tasks a grace window.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.load(Ordering::Acquire),
                    "drain timeout, abandoning in-flight queries"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.active.store(None);
        info!("forwarder stopped");
    }

    fn relay_context(&self) -> RelayContext {
        RelayContext {
            transport: Arc::clone(&self.transport),
            active: Arc::clone(&self.active),
            stats: Arc::clone(&self.stats),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    async fn bind_udp(addr: SocketAddr) -> DnsResult<UdpSocket> {
        UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP {addr}"), e))
    }

    async fn bind_tcp(addr: SocketAddr) -> DnsResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP {addr}"), e))
    }
}

/// Everything a listener needs to relay one query
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub(crate) transport: Arc<UpstreamTransport>,
    pub(crate) active: Arc<ArcSwapOption<Provider>>,
    pub(crate) stats: Arc<ForwarderStats>,
    pub(crate) in_flight: Arc<AtomicU64>,
}

impl RelayContext {
    /// Relay one query to the active provider
    ///
    /// Returns `None` when no provider is active or the upstream failed;
    /// the caller decides whether that drops a datagram or a connection.
    pub(crate) async fn relay(&self, query: &[u8]) -> Option<Vec<u8>> {
        let provider = self.active.load_full()?;

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let result = self.transport.query(&provider, query).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(provider = %provider.name, error = %e, "relay failed");
                self.stats.record_failed();
                None
            }
        }
    }
}
