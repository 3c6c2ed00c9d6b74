//! Periodic upstream health probing
//!
//! One recurring task probes the active provider with the same synthetic
//! query the control state machine uses. The monitor reports rather than
//! drives: a failed probe is recorded on the control service, which
//! broadcasts the Connected → Error notification to IPC clients, while the
//! lifecycle state itself stays with explicit transitions.
//!
//! Probes only run while the status is Connected; an Inactive or Error
//! service is not probed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::control::{ControlService, TEST_DOMAIN};
use crate::settings::ConnectionStatus;

/// Default probe interval
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Time between probes
    pub interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

impl HealthMonitorConfig {
    /// Set the probe interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// The recurring health probe task
pub struct HealthMonitor {
    control: Arc<ControlService>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    /// Create a monitor over the control service
    #[must_use]
    pub fn new(control: Arc<ControlService>, config: HealthMonitorConfig) -> Self {
        Self { control, config }
    }

    /// Spawn the probe loop; it stops cooperatively on the shutdown signal
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.interval, "health monitor running");
            let mut ticker = tokio::time::interval(self.config.interval);
            // The first tick fires immediately; skip it so a fresh start
            // is not probed before its own synthetic test settles.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.probe_once().await,
                    _ = shutdown.recv() => {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One probe pass, skipped unless the service is Connected
    async fn probe_once(&self) {
        if self.control.snapshot().status != ConnectionStatus::Connected {
            trace!("not connected, skipping health probe");
            return;
        }

        let Some(provider) = self.control.active_provider() else {
            return;
        };

        match self.control.test_provider(&provider, TEST_DOMAIN).await {
            Ok(latency_ms) => {
                debug!(provider = %provider.name, latency_ms, "health probe ok");
                self.control.record_health_result(true, None);
            }
            Err(e) => {
                self.control
                    .record_health_result(false, Some(e.to_string()));
            }
        }
    }
}
