//! Host network adapter control
//!
//! Enumerates the host's network adapters, snapshots their DNS settings,
//! rewrites them to loopback for the takeover, and restores them from the
//! snapshot afterwards. The persisted backup list in the settings document
//! is the source of truth for what still needs restoring, including after a
//! crash.
//!
//! Per-adapter failures never abort the whole operation: the controller
//! logs, skips, and moves to the next adapter. A takeover only fails
//! outright when no adapter at all could be updated.

pub mod platform;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use platform::{native_ops, AdapterOps};

use crate::error::AdapterError;
use crate::settings::types::unix_millis;
use crate::settings::{AdapterBackup, SettingsStore};

/// Loopback addresses applied during takeover
pub const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::LOCALHOST;
/// Loopback addresses applied during takeover
pub const LOOPBACK_V6: Ipv6Addr = Ipv6Addr::LOCALHOST;

/// A host network adapter with its current DNS configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAdapter {
    /// Stable platform identifier
    pub id: String,

    /// Interface index
    pub interface_index: u32,

    /// Human-readable name
    pub name: String,

    /// Optional hardware/driver description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the adapter currently has link
    pub connected: bool,

    /// True if DNS is obtained from DHCP
    pub dhcp: bool,

    /// Currently effective IPv4 DNS servers
    #[serde(default)]
    pub ipv4_dns: Vec<Ipv4Addr>,

    /// Currently effective IPv6 DNS servers
    #[serde(default)]
    pub ipv6_dns: Vec<Ipv6Addr>,
}

impl NetworkAdapter {
    /// Identity triple used to address the adapter in platform commands
    #[must_use]
    pub fn key(&self) -> AdapterKey {
        AdapterKey {
            id: self.id.clone(),
            interface_index: self.interface_index,
            name: self.name.clone(),
        }
    }
}

/// Just enough identity to address an adapter in platform tooling
///
/// Restoration works from persisted backups, so the adapter may no longer
/// appear in a fresh enumeration when this is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterKey {
    /// Stable platform identifier
    pub id: String,
    /// Interface index
    pub interface_index: u32,
    /// Human-readable name
    pub name: String,
}

impl From<&AdapterBackup> for AdapterKey {
    fn from(backup: &AdapterBackup) -> Self {
        Self {
            id: backup.adapter_id.clone(),
            interface_index: backup.interface_index,
            name: backup.name.clone(),
        }
    }
}

/// Outcome of a takeover or restore pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterReport {
    /// Adapters successfully updated
    pub updated: usize,
    /// Adapters that failed and were skipped
    pub failed: usize,
}

/// Drives backup, loopback takeover and restoration across adapters
pub struct AdapterController {
    ops: Arc<dyn AdapterOps>,
    settings: Arc<SettingsStore>,
}

impl AdapterController {
    /// Create a controller over the given platform operations
    #[must_use]
    pub fn new(ops: Arc<dyn AdapterOps>, settings: Arc<SettingsStore>) -> Self {
        Self { ops, settings }
    }

    /// Enumerate adapters, optionally restricted to connected ones
    ///
    /// Loopback and tunnel interfaces are already filtered by the platform
    /// layer.
    pub async fn list(&self, connected_only: bool) -> Result<Vec<NetworkAdapter>, AdapterError> {
        let mut adapters = self.ops.list().await?;
        if connected_only {
            adapters.retain(|a| a.connected);
        }
        Ok(adapters)
    }

    /// Take over the given adapters: back up, then point DNS at loopback
    ///
    /// An adapter that already has a backup keeps it; re-applying loopback
    /// is idempotent and never overwrites the original snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::NoAdapterUpdated` when every targeted adapter
    /// failed; partial failure is success with a nonzero `failed` count.
    pub async fn take_over(&self, adapter_ids: &[String]) -> Result<AdapterReport, AdapterError> {
        let adapters = self.ops.list().await?;
        let mut report = AdapterReport::default();

        for id in adapter_ids {
            let Some(adapter) = adapters.iter().find(|a| &a.id == id) else {
                warn!(adapter = %id, "adapter not found, skipping");
                report.failed += 1;
                continue;
            };

            match self.take_over_one(adapter).await {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    warn!(adapter = %adapter.name, error = %e, "takeover failed, continuing");
                    report.failed += 1;
                }
            }
        }

        if report.updated == 0 && !adapter_ids.is_empty() {
            return Err(AdapterError::NoAdapterUpdated {
                attempted: adapter_ids.len(),
            });
        }
        info!(updated = report.updated, failed = report.failed, "adapter takeover done");
        Ok(report)
    }

    async fn take_over_one(&self, adapter: &NetworkAdapter) -> Result<(), AdapterError> {
        if self.settings.backup_for(&adapter.id).await.is_none() {
            let backup = AdapterBackup {
                adapter_id: adapter.id.clone(),
                interface_index: adapter.interface_index,
                name: adapter.name.clone(),
                ipv4_dns: adapter.ipv4_dns.clone(),
                ipv6_dns: adapter.ipv6_dns.clone(),
                dhcp: adapter.dhcp,
                captured_at: unix_millis(),
            };
            debug!(adapter = %adapter.name, dhcp = backup.dhcp, "capturing DNS backup");
            if let Err(e) = self.settings.put_backup(backup).await {
                // Without a persisted backup there is nothing to restore
                // from later; do not touch this adapter.
                return Err(AdapterError::ApplyFailed {
                    adapter: adapter.name.clone(),
                    reason: format!("backup not persisted: {e}"),
                });
            }
        }

        self.ops
            .set_dns(&adapter.key(), &[LOOPBACK_V4], &[LOOPBACK_V6])
            .await
    }

    /// Restore every backed-up adapter and drop the backups that succeeded
    pub async fn restore_all(&self) -> Result<AdapterReport, AdapterError> {
        let backups = self.settings.backups().await;
        let mut report = AdapterReport::default();

        for backup in backups {
            match self.restore_one(&backup).await {
                Ok(()) => {
                    if let Err(e) = self.settings.remove_backup(&backup.adapter_id).await {
                        warn!(adapter = %backup.name, error = %e, "restored but backup not removed");
                    }
                    report.updated += 1;
                }
                Err(e) => {
                    // Keep the backup; the next restore pass retries it.
                    warn!(adapter = %backup.name, error = %e, "restore failed, keeping backup");
                    report.failed += 1;
                }
            }
        }

        info!(restored = report.updated, failed = report.failed, "adapter restore done");
        Ok(report)
    }

    async fn restore_one(&self, backup: &AdapterBackup) -> Result<(), AdapterError> {
        let key = AdapterKey::from(backup);
        if backup.dhcp {
            debug!(adapter = %backup.name, "restoring DHCP-assigned DNS");
            self.ops.reset_dhcp(&key).await
        } else {
            debug!(adapter = %backup.name, "restoring static DNS lists");
            self.ops.set_dns(&key, &backup.ipv4_dns, &backup.ipv6_dns).await
        }
    }

    /// Flush the OS resolver cache
    pub async fn flush_cache(&self) -> Result<(), AdapterError> {
        self.ops.flush_cache().await
    }
}
