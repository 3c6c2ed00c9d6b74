//! Control state machine
//!
//! Owns the service lifecycle: Inactive → Connecting → Testing →
//! Connected/Error, the default-versus-temporary active provider
//! distinction, and the start/switch/revert/disable transitions. The
//! forwarder, settings store and adapter controller are collaborators; this
//! module is the only writer of the active-provider reference.
//!
//! Transitions are serialized: concurrent switch requests queue behind one
//! lock and the last one wins the active reference. Status changes are
//! broadcast for the IPC server to fan out to connected clients.

use std::sync::Arc;
use std::time::Instant;

use hickory_proto::rr::RecordType;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{AdapterController, AdapterReport};
use crate::dns::forwarder::Forwarder;
use crate::dns::upstream::UpstreamTransport;
use crate::dns::wire;
use crate::error::ControlError;
use crate::settings::types::unix_millis;
use crate::settings::{ConnectionStatus, Profile, Provider, SettingsStore};

/// Domain used for the synthetic connectivity probe
pub const TEST_DOMAIN: &str = "example.com";

/// Capacity of the status-change broadcast channel
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// A status transition, broadcast to IPC clients
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Status before the transition
    pub previous: ConnectionStatus,
    /// Status after the transition
    pub current: ConnectionStatus,
    /// Human-readable context, set on failures
    pub message: Option<String>,
}

/// Point-in-time view of the control state for `GetStatus`
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Current lifecycle status
    pub status: ConnectionStatus,
    /// Active provider, if any
    pub active_provider_id: Option<Uuid>,
    /// Active provider display name
    pub active_provider_name: Option<String>,
    /// Whether the active provider is a temporary connection
    pub is_temporary: bool,
    /// Last recorded error message
    pub last_error: Option<String>,
    /// Timestamp of the last health probe, unix milliseconds
    pub last_health_check: Option<u64>,
    /// Successfully forwarded queries since process start
    pub queries_handled: u64,
}

/// Mutable control state, guarded by a read-write lock
#[derive(Debug, Default)]
struct ControlState {
    status: ConnectionStatus,
    active: Option<Arc<Provider>>,
    default_provider: Option<Arc<Provider>>,
    is_temporary: bool,
    last_error: Option<String>,
    last_health_check: Option<u64>,
}

/// The service control state machine
pub struct ControlService {
    settings: Arc<SettingsStore>,
    forwarder: Arc<Forwarder>,
    adapters: Arc<AdapterController>,
    transport: Arc<UpstreamTransport>,
    state: RwLock<ControlState>,
    /// Serializes start/switch/stop; the last queued switch wins
    transitions: Mutex<()>,
    status_tx: broadcast::Sender<StatusChange>,
}

impl ControlService {
    /// Wire up the state machine with its collaborators
    #[must_use]
    pub fn new(
        settings: Arc<SettingsStore>,
        forwarder: Arc<Forwarder>,
        adapters: Arc<AdapterController>,
        transport: Arc<UpstreamTransport>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            settings,
            forwarder,
            adapters,
            transport,
            state: RwLock::new(ControlState::default()),
            transitions: Mutex::new(()),
            status_tx,
        }
    }

    /// Subscribe to status transitions
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Current state for `GetStatus`
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.read();
        StatusSnapshot {
            status: state.status,
            active_provider_id: state.active.as_ref().map(|p| p.id),
            active_provider_name: state.active.as_ref().map(|p| p.name.clone()),
            is_temporary: state.is_temporary,
            last_error: state.last_error.clone(),
            last_health_check: state.last_health_check,
            queries_handled: self.forwarder.queries_handled(),
        }
    }

    /// The provider `RevertToDefault` returns to
    #[must_use]
    pub fn default_provider(&self) -> Option<Arc<Provider>> {
        self.state.read().default_provider.clone()
    }

    /// The provider new queries are relayed to
    #[must_use]
    pub fn active_provider(&self) -> Option<Arc<Provider>> {
        self.state.read().active.clone()
    }

    fn set_status(&self, status: ConnectionStatus, message: Option<String>) {
        let previous = {
            let mut state = self.state.write();
            let previous = state.status;
            state.status = status;
            if let Some(ref msg) = message {
                state.last_error = Some(msg.clone());
            }
            previous
        };

        if previous != status {
            debug!(from = %previous, to = %status, "status transition");
            let _ = self.status_tx.send(StatusChange {
                previous,
                current: status,
                message,
            });
        }
    }

    /// Start forwarding with `provider` as both active and default
    ///
    /// A start while not Inactive is treated as stop-then-start. On bind
    /// failure the state returns to Inactive and the error names the
    /// conflicting address; on test failure the sockets stay bound and the
    /// state is Error so a later switch can recover without a re-bind.
    pub async fn start(&self, provider: Arc<Provider>) -> Result<ConnectionStatus, ControlError> {
        let _guard = self.transitions.lock().await;

        if self.forwarder.is_running() {
            info!("start requested while running, stopping first");
            self.stop_locked().await;
        }

        self.set_status(ConnectionStatus::Connecting, None);

        if let Err(e) = self.forwarder.start(Arc::clone(&provider)).await {
            let message = e.to_string();
            self.set_status(ConnectionStatus::Inactive, Some(message.clone()));
            {
                let mut state = self.state.write();
                state.active = None;
                state.is_temporary = false;
            }
            return Err(ControlError::BindFailed {
                addr: "loopback:53".into(),
                reason: message,
            });
        }

        {
            let mut state = self.state.write();
            state.active = Some(Arc::clone(&provider));
            state.default_provider = Some(Arc::clone(&provider));
            state.is_temporary = false;
            state.last_error = None;
        }

        Ok(self.run_synthetic_test(&provider).await)
    }

    /// Switch the active provider
    ///
    /// A temporary switch leaves the default untouched in memory and on
    /// disk. The synthetic test re-runs and decides Connected versus Error.
    pub async fn switch(
        &self,
        provider: Arc<Provider>,
        is_temporary: bool,
    ) -> Result<ConnectionStatus, ControlError> {
        let _guard = self.transitions.lock().await;
        self.switch_locked(provider, is_temporary).await
    }

    async fn switch_locked(
        &self,
        provider: Arc<Provider>,
        is_temporary: bool,
    ) -> Result<ConnectionStatus, ControlError> {
        if !self.forwarder.is_running() {
            return Err(ControlError::NotRunning {
                status: self.state.read().status.to_string(),
            });
        }

        let outgoing = self.state.read().active.as_ref().map(|p| p.id);

        // Pooled DoH connections dial with the bootstrap list that was
        // current at connect time; drop them so the switch takes effect.
        if let Some(id) = outgoing {
            self.transport.invalidate_doh(id);
        }
        self.transport.invalidate_doh(provider.id);

        self.forwarder.set_active(Arc::clone(&provider));
        {
            let mut state = self.state.write();
            state.active = Some(Arc::clone(&provider));
            state.is_temporary = is_temporary;
            if !is_temporary {
                state.default_provider = Some(Arc::clone(&provider));
            }
        }

        info!(provider = %provider.name, temporary = is_temporary, "provider switched");
        Ok(self.run_synthetic_test(&provider).await)
    }

    /// Switch back to the default provider, clearing the temporary flag
    pub async fn revert_to_default(&self) -> Result<ConnectionStatus, ControlError> {
        let _guard = self.transitions.lock().await;

        let default = self
            .state
            .read()
            .default_provider
            .clone()
            .ok_or(ControlError::NotRunning {
                status: ConnectionStatus::Inactive.to_string(),
            })?;

        self.switch_locked(default, false).await
    }

    /// Unconditional teardown from any state
    pub async fn stop(&self) {
        let _guard = self.transitions.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        self.forwarder.stop().await;
        {
            let mut state = self.state.write();
            state.active = None;
            state.is_temporary = false;
        }
        self.set_status(ConnectionStatus::Inactive, None);
    }

    /// Stop forwarding, optionally restore adapter DNS, record the intent
    ///
    /// Adapter restore failures are nonfatal: the surviving backups stay in
    /// the settings document for the next opportunity.
    pub async fn disable(&self, restore_dns: bool) -> Result<AdapterReport, ControlError> {
        self.stop().await;

        let report = if restore_dns {
            match self.adapters.restore_all().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "adapter restore incomplete");
                    AdapterReport::default()
                }
            }
        } else {
            AdapterReport::default()
        };

        if let Err(e) = self.settings.set_enabled(false).await {
            warn!(error = %e, "failed to persist enabled=false");
        }

        Ok(report)
    }

    /// One-shot latency probe against an arbitrary provider
    ///
    /// Does not touch the state machine or the active reference.
    pub async fn test_provider(
        &self,
        provider: &Provider,
        domain: &str,
    ) -> Result<u64, ControlError> {
        let started = Instant::now();
        self.probe(provider, domain).await.map_err(|reason| {
            ControlError::TestFailed {
                provider: provider.name.clone(),
                reason,
            }
        })?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(started.elapsed().as_millis() as u64)
    }

    /// Record the outcome of a health probe
    ///
    /// The monitor reports rather than drives: a failed probe broadcasts a
    /// Connected → Error notification but leaves the lifecycle state to the
    /// next explicit transition.
    pub fn record_health_result(&self, healthy: bool, message: Option<String>) {
        {
            let mut state = self.state.write();
            state.last_health_check = Some(unix_millis());
            if !healthy {
                state.last_error = message.clone();
            }
        }

        if !healthy {
            warn!(message = ?message, "health probe failed");
            let _ = self.status_tx.send(StatusChange {
                previous: ConnectionStatus::Connected,
                current: ConnectionStatus::Error,
                message,
            });
        }
    }

    /// Run the synthetic probe and move to Connected or Error
    async fn run_synthetic_test(&self, provider: &Provider) -> ConnectionStatus {
        self.set_status(ConnectionStatus::Testing, None);

        match self.probe(provider, TEST_DOMAIN).await {
            Ok(()) => {
                self.state.write().last_error = None;
                self.set_status(ConnectionStatus::Connected, None);
                ConnectionStatus::Connected
            }
            Err(reason) => {
                warn!(provider = %provider.name, reason = %reason, "synthetic test failed");
                self.set_status(ConnectionStatus::Error, Some(reason));
                ConnectionStatus::Error
            }
        }
    }

    /// One probe query through the upstream transport
    async fn probe(&self, provider: &Provider, domain: &str) -> Result<(), String> {
        let query = wire::build_query(domain, RecordType::A).map_err(|e| e.to_string())?;

        let reply = self
            .transport
            .query(provider, &query)
            .await
            .map_err(|e| e.to_string())?;

        match wire::response_code(&reply) {
            Some(wire::RCODE_NO_ERROR) => Ok(()),
            Some(rcode) => Err(format!("upstream answered rcode {rcode}")),
            None => Err("upstream reply shorter than a DNS header".into()),
        }
    }

    /// Persist a profile as the default and optionally bring it up
    ///
    /// This is the `ApplyProfile` verb: the profile becomes the on-disk
    /// default; with `enable` the targeted adapters are taken over and the
    /// forwarder is started (or switched if already running).
    pub async fn apply_profile(
        &self,
        profile: Profile,
        enable: bool,
    ) -> Result<ConnectionStatus, ControlError> {
        let provider = self
            .settings
            .provider_by_id(profile.provider_id)
            .await
            .map(Arc::new)
            .ok_or_else(|| ControlError::ProviderNotFound {
                id: profile.provider_id.to_string(),
            })?;

        let adapter_ids = profile.adapter_ids.clone();
        if let Err(e) = self.settings.set_default_profile(Some(profile)).await {
            warn!(error = %e, "default profile not persisted");
        }
        {
            let mut state = self.state.write();
            state.default_provider = Some(Arc::clone(&provider));
        }

        if !enable {
            return Ok(self.state.read().status);
        }

        if !adapter_ids.is_empty() {
            if let Err(e) = self.adapters.take_over(&adapter_ids).await {
                // Forwarding without any taken-over adapter is useless;
                // surface the failure before touching the forwarder.
                return Err(ControlError::TakeoverFailed {
                    reason: e.to_string(),
                });
            }
        }

        let status = if self.forwarder.is_running() {
            self.switch(provider, false).await?
        } else {
            self.start(provider).await?
        };

        if let Err(e) = self.settings.set_enabled(true).await {
            warn!(error = %e, "failed to persist enabled=true");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::platform::AdapterOps;
    use crate::adapter::{AdapterKey, NetworkAdapter};
    use crate::dns::forwarder::ForwarderConfig;
    use crate::error::AdapterError;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use tempfile::tempdir;
    use tokio::net::UdpSocket;

    /// Adapter fixture that accepts everything
    struct NullOps;

    #[async_trait]
    impl AdapterOps for NullOps {
        async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
            Ok(vec![])
        }
        async fn set_dns(
            &self,
            _: &AdapterKey,
            _: &[Ipv4Addr],
            _: &[Ipv6Addr],
        ) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn reset_dhcp(&self, _: &AdapterKey) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn flush_cache(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    /// Minimal answering upstream: replies to any query with an A record
    /// answer built from the query's own header and question.
    async fn spawn_answering_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                let reply = answer_for(&buf[..len]);
                let _ = socket.send_to(&reply, src).await;
            }
        });
        addr
    }

    /// Build a one-answer response echoing the query's ID and question
    fn answer_for(query: &[u8]) -> Vec<u8> {
        let mut reply = query.to_vec();
        reply[2] = 0x81; // QR + RD
        reply[3] = 0x80; // RA, RCODE 0
        reply[6] = 0x00;
        reply[7] = 0x01; // ANCOUNT 1
        // Answer: pointer to the question name, type A, class IN, TTL, RDATA
        reply.extend_from_slice(&[
            0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2C, 0x00, 0x04, 93, 184, 216,
            34,
        ]);
        reply
    }

    struct Harness {
        control: ControlService,
        upstream: SocketAddr,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let settings = Arc::new(SettingsStore::load_or_default(dir.path().join("config.json")));
        let upstream = spawn_answering_upstream().await;
        // Classical queries go to the fake upstream's ephemeral port
        let transport = Arc::new(UpstreamTransport::with_dns_port(upstream.port()));
        let forwarder = Arc::new(Forwarder::with_config(
            Arc::clone(&transport),
            ForwarderConfig::ephemeral_v4(),
        ));
        let adapters = Arc::new(AdapterController::new(Arc::new(NullOps), Arc::clone(&settings)));

        Harness {
            control: ControlService::new(settings, forwarder, adapters, transport),
            upstream,
            _dir: dir,
        }
    }

    /// Provider that cannot answer: the probe will fail fast only with a
    /// short timeout, so tests that exercise the Error path use the real
    /// blackhole address sparingly.
    fn unreachable_provider() -> Arc<Provider> {
        Arc::new(Provider::standard(
            "blackhole",
            Some(Ipv4Addr::new(127, 88, 88, 88)),
            None,
            None,
            None,
        ))
    }

    fn local_provider(upstream: SocketAddr) -> Arc<Provider> {
        let v4 = match upstream.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => unreachable!("fixture binds IPv4 loopback"),
        };
        Arc::new(Provider::standard("local", Some(v4), None, None, None))
    }

    // ========================================================================
    // Transition Tests
    // ========================================================================

    #[tokio::test]
    async fn test_initial_state_inactive() {
        let h = harness().await;
        let snapshot = h.control.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Inactive);
        assert!(snapshot.active_provider_id.is_none());
        assert!(!snapshot.is_temporary);
    }

    #[tokio::test]
    async fn test_switch_while_inactive_is_error() {
        let h = harness().await;
        let err = h
            .control
            .switch(local_provider(h.upstream), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_stop_from_any_state() {
        let h = harness().await;
        // Stopping while inactive is a no-op that stays Inactive
        h.control.stop().await;
        assert_eq!(h.control.snapshot().status, ConnectionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_temporary_switch_preserves_default() {
        let h = harness().await;
        let default = unreachable_provider();
        let temporary = local_provider(h.upstream);

        // Bring the forwarder up with the default (test will fail against
        // the blackhole and land in Error; sockets stay bound).
        // Use a provider that cannot answer but with the status outcome
        // irrelevant to the default bookkeeping under test.
        let status = h.control.start(Arc::clone(&default)).await.unwrap();
        assert_eq!(status, ConnectionStatus::Error);
        assert_eq!(h.control.snapshot().status, ConnectionStatus::Error);

        // Temporary switch: active moves, default does not
        h.control
            .switch(Arc::clone(&temporary), true)
            .await
            .unwrap();

        let snapshot = h.control.snapshot();
        assert_eq!(snapshot.active_provider_id, Some(temporary.id));
        assert!(snapshot.is_temporary);
        assert_eq!(h.control.default_provider().unwrap().id, default.id);

        h.control.stop().await;
    }

    #[tokio::test]
    async fn test_permanent_switch_moves_default() {
        let h = harness().await;
        let first = unreachable_provider();
        let second = local_provider(h.upstream);

        h.control.start(Arc::clone(&first)).await.unwrap();
        h.control.switch(Arc::clone(&second), false).await.unwrap();

        assert_eq!(h.control.default_provider().unwrap().id, second.id);
        assert!(!h.control.snapshot().is_temporary);

        h.control.stop().await;
    }

    #[tokio::test]
    async fn test_revert_to_default() {
        let h = harness().await;
        let default = local_provider(h.upstream);
        let temporary = unreachable_provider();

        h.control.start(Arc::clone(&default)).await.unwrap();
        h.control.switch(temporary, true).await.unwrap();
        assert!(h.control.snapshot().is_temporary);

        let status = h.control.revert_to_default().await.unwrap();
        assert_eq!(status, ConnectionStatus::Connected);

        let snapshot = h.control.snapshot();
        assert_eq!(snapshot.active_provider_id, Some(default.id));
        assert!(!snapshot.is_temporary);

        h.control.stop().await;
    }

    #[tokio::test]
    async fn test_stop_resets_to_inactive() {
        let h = harness().await;
        h.control.start(local_provider(h.upstream)).await.unwrap();
        assert_eq!(h.control.snapshot().status, ConnectionStatus::Connected);

        h.control.stop().await;
        let snapshot = h.control.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Inactive);
        assert!(snapshot.active_provider_id.is_none());
    }

    #[tokio::test]
    async fn test_start_while_running_restarts() {
        let h = harness().await;
        let provider = local_provider(h.upstream);

        h.control.start(Arc::clone(&provider)).await.unwrap();
        // Second start must not error: stop-then-start semantics
        let status = h.control.start(provider).await.unwrap();
        assert_eq!(status, ConnectionStatus::Connected);

        h.control.stop().await;
    }

    // ========================================================================
    // Probe Tests
    // ========================================================================

    #[tokio::test]
    async fn test_test_provider_latency() {
        let h = harness().await;
        let provider = local_provider(h.upstream);

        let latency = h
            .control
            .test_provider(&provider, "example.com")
            .await
            .unwrap();
        assert!(latency < 5_000);

        // One-shot probes never touch the state machine
        assert_eq!(h.control.snapshot().status, ConnectionStatus::Inactive);
    }

    #[tokio::test]
    async fn test_health_result_reports_without_driving() {
        let h = harness().await;
        let mut status_rx = h.control.subscribe_status();

        h.control.start(local_provider(h.upstream)).await.unwrap();
        // Drain the transitions from start
        while status_rx.try_recv().is_ok() {}

        h.control
            .record_health_result(false, Some("probe timed out".into()));

        let change = status_rx.try_recv().unwrap();
        assert_eq!(change.previous, ConnectionStatus::Connected);
        assert_eq!(change.current, ConnectionStatus::Error);

        // The lifecycle state is untouched; the monitor only reports
        assert_eq!(h.control.snapshot().status, ConnectionStatus::Connected);
        assert!(h.control.snapshot().last_health_check.is_some());

        h.control.stop().await;
    }
}
