//! Configuration data model
//!
//! These types mirror the persisted JSON document exactly (lowerCamelCase
//! property names, `type`-tagged provider variants). Model entities are
//! plain data: mutation goes through the [`super::store::SettingsStore`] and
//! change notification is coarse-grained via its broadcast channel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettingsError;

/// Current schema version of the settings document
pub const SETTINGS_VERSION: u32 = 1;

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Milliseconds since the Unix epoch
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An upstream DNS provider
///
/// Providers come in two shapes: classical servers addressed by IP literal,
/// and `DoH` endpoints addressed by URL. Built-in providers ship with fixed
/// identifiers so user settings stay stable across releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Stable identifier, unique within the settings document
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Optional free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// True for shipped presets, false for user-added entries
    #[serde(default)]
    pub built_in: bool,

    /// Transport-specific addressing
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Transport variant of a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderKind {
    /// Classical DNS over UDP port 53
    #[serde(rename = "standard", rename_all = "camelCase")]
    Standard {
        /// Primary IPv4 server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_ipv4: Option<Ipv4Addr>,
        /// Secondary IPv4 server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secondary_ipv4: Option<Ipv4Addr>,
        /// Primary IPv6 server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_ipv6: Option<Ipv6Addr>,
        /// Secondary IPv6 server
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secondary_ipv6: Option<Ipv6Addr>,
    },

    /// DNS-over-HTTPS endpoint
    #[serde(rename = "doh", rename_all = "camelCase")]
    DoH {
        /// Absolute https URL of the endpoint
        url: String,
        /// IP literals allowed to originate the initial connection
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        bootstrap_ips: Vec<IpAddr>,
    },
}

impl Provider {
    /// Create a classical provider from up to four server addresses
    #[must_use]
    pub fn standard(
        name: impl Into<String>,
        primary_ipv4: Option<Ipv4Addr>,
        secondary_ipv4: Option<Ipv4Addr>,
        primary_ipv6: Option<Ipv6Addr>,
        secondary_ipv6: Option<Ipv6Addr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            built_in: false,
            kind: ProviderKind::Standard {
                primary_ipv4,
                secondary_ipv4,
                primary_ipv6,
                secondary_ipv6,
            },
        }
    }

    /// Create a `DoH` provider from an endpoint URL and bootstrap list
    #[must_use]
    pub fn doh(name: impl Into<String>, url: impl Into<String>, bootstrap_ips: Vec<IpAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            built_in: false,
            kind: ProviderKind::DoH {
                url: url.into(),
                bootstrap_ips,
            },
        }
    }

    /// Whether this provider uses `DoH`
    #[must_use]
    pub fn is_doh(&self) -> bool {
        matches!(self.kind, ProviderKind::DoH { .. })
    }

    /// Upstream candidates in fixed failover order, port 53
    ///
    /// Order is primary IPv4, secondary IPv4, primary IPv6, secondary IPv6,
    /// with absent entries skipped. Empty for `DoH` providers.
    #[must_use]
    pub fn candidate_addrs(&self) -> Vec<SocketAddr> {
        match &self.kind {
            ProviderKind::Standard {
                primary_ipv4,
                secondary_ipv4,
                primary_ipv6,
                secondary_ipv6,
            } => {
                let mut addrs = Vec::with_capacity(4);
                if let Some(ip) = primary_ipv4 {
                    addrs.push(SocketAddr::new(IpAddr::V4(*ip), DNS_PORT));
                }
                if let Some(ip) = secondary_ipv4 {
                    addrs.push(SocketAddr::new(IpAddr::V4(*ip), DNS_PORT));
                }
                if let Some(ip) = primary_ipv6 {
                    addrs.push(SocketAddr::new(IpAddr::V6(*ip), DNS_PORT));
                }
                if let Some(ip) = secondary_ipv6 {
                    addrs.push(SocketAddr::new(IpAddr::V6(*ip), DNS_PORT));
                }
                addrs
            }
            ProviderKind::DoH { .. } => Vec::new(),
        }
    }

    /// Validate the provider's invariants
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidProvider` if a Standard provider has
    /// no addresses or a `DoH` provider has a non-https URL.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match &self.kind {
            ProviderKind::Standard { .. } => {
                if self.candidate_addrs().is_empty() {
                    return Err(SettingsError::InvalidProvider {
                        name: self.name.clone(),
                        reason: "a standard provider needs at least one server address".into(),
                    });
                }
            }
            ProviderKind::DoH { url, .. } => {
                if !url.starts_with("https://") || url.len() <= "https://".len() {
                    return Err(SettingsError::InvalidProvider {
                        name: self.name.clone(),
                        reason: format!("'{url}' is not an absolute https URL"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A provider choice plus the adapters it should be applied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// The selected provider
    pub provider_id: Uuid,

    /// Adapter identifiers targeted for loopback takeover
    #[serde(default)]
    pub adapter_ids: Vec<String>,
}

/// Snapshot of an adapter's DNS configuration before takeover
///
/// At most one backup exists per adapter; it is created when the adapter is
/// first taken over and removed after a successful restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterBackup {
    /// Adapter identifier (platform-specific, stable)
    pub adapter_id: String,

    /// Interface index at capture time
    pub interface_index: u32,

    /// Human-readable adapter name
    pub name: String,

    /// IPv4 DNS servers as written before takeover
    #[serde(default)]
    pub ipv4_dns: Vec<Ipv4Addr>,

    /// IPv6 DNS servers as written before takeover
    #[serde(default)]
    pub ipv6_dns: Vec<Ipv6Addr>,

    /// True if DNS was obtained from DHCP
    pub dhcp: bool,

    /// Capture timestamp, milliseconds since the Unix epoch
    pub captured_at: u64,
}

/// The persisted settings document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Schema version
    pub version: u32,

    /// Known providers (built-in presets plus user entries)
    pub providers: Vec<Provider>,

    /// The persistent default choice, if the user made one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<Profile>,

    /// Last user intent: should forwarding be active
    pub enabled: bool,

    /// Re-apply the default profile when the service starts with the host
    pub apply_on_boot: bool,

    /// Outstanding adapter backups awaiting restoration
    #[serde(default)]
    pub adapter_backups: Vec<AdapterBackup>,

    /// Control-surface preferences, opaque to the service
    #[serde(default)]
    pub ui_settings: serde_json::Value,

    /// Unknown fields, preserved across load/save round-trips
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AppSettings {
    /// Look up a provider by identifier
    #[must_use]
    pub fn provider_by_id(&self, id: Uuid) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Look up an adapter backup by adapter identifier
    #[must_use]
    pub fn backup_for(&self, adapter_id: &str) -> Option<&AdapterBackup> {
        self.adapter_backups.iter().find(|b| b.adapter_id == adapter_id)
    }
}

/// Connection lifecycle of the forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Forwarder stopped, no sockets bound
    #[default]
    Inactive,
    /// Sockets are being bound
    Connecting,
    /// Sockets bound, synthetic test in flight
    Testing,
    /// Synthetic test passed, forwarding
    Connected,
    /// Sockets bound but the active provider is failing
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Connecting => "connecting",
            Self::Testing => "testing",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    // ========================================================================
    // Provider Tests
    // ========================================================================

    #[test]
    fn test_candidate_addr_ordering() {
        let provider = Provider::standard(
            "test",
            Some(v4("1.1.1.1")),
            Some(v4("1.0.0.1")),
            Some("2606:4700:4700::1111".parse().unwrap()),
            None,
        );

        let addrs = provider.candidate_addrs();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0].ip(), IpAddr::V4(v4("1.1.1.1")));
        assert_eq!(addrs[1].ip(), IpAddr::V4(v4("1.0.0.1")));
        assert!(addrs[2].is_ipv6());
        assert!(addrs.iter().all(|a| a.port() == DNS_PORT));
    }

    #[test]
    fn test_candidate_addrs_skip_empty_slots() {
        let provider = Provider::standard("test", None, Some(v4("8.8.4.4")), None, None);
        let addrs = provider.candidate_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip(), IpAddr::V4(v4("8.8.4.4")));
    }

    #[test]
    fn test_standard_provider_requires_address() {
        let provider = Provider::standard("empty", None, None, None, None);
        assert!(provider.validate().is_err());

        let provider = Provider::standard("ok", Some(v4("9.9.9.9")), None, None, None);
        assert!(provider.validate().is_ok());
    }

    #[test]
    fn test_doh_provider_requires_https() {
        let provider = Provider::doh("plain", "http://dns.example/dns-query", vec![]);
        assert!(provider.validate().is_err());

        let provider = Provider::doh("bare", "https://", vec![]);
        assert!(provider.validate().is_err());

        let provider = Provider::doh("ok", "https://dns.example/dns-query", vec![]);
        assert!(provider.validate().is_ok());
        assert!(provider.is_doh());
        assert!(provider.candidate_addrs().is_empty());
    }

    // ========================================================================
    // Serialization Tests
    // ========================================================================

    #[test]
    fn test_provider_json_shape() {
        let mut provider = Provider::standard("Cloudflare", Some(v4("1.1.1.1")), None, None, None);
        provider.built_in = true;

        let json = serde_json::to_string(&provider).unwrap();
        assert!(json.contains("\"type\":\"standard\""));
        assert!(json.contains("\"primaryIpv4\":\"1.1.1.1\""));
        assert!(json.contains("\"builtIn\":true"));
        // Absent slots are omitted, not serialized as null
        assert!(!json.contains("secondaryIpv4"));

        let parsed: Provider = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, provider);
    }

    #[test]
    fn test_doh_provider_json_shape() {
        let provider = Provider::doh(
            "Cloudflare DoH",
            "https://cloudflare-dns.com/dns-query",
            vec!["1.1.1.1".parse().unwrap()],
        );

        let json = serde_json::to_string(&provider).unwrap();
        assert!(json.contains("\"type\":\"doh\""));
        assert!(json.contains("\"url\":\"https://cloudflare-dns.com/dns-query\""));
        assert!(json.contains("\"bootstrapIps\":[\"1.1.1.1\"]"));

        let parsed: Provider = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, provider);
    }

    #[test]
    fn test_settings_preserve_unknown_fields() {
        let json = r#"{
            "version": 1,
            "providers": [],
            "enabled": false,
            "applyOnBoot": true,
            "adapterBackups": [],
            "uiSettings": {"theme": "dark"},
            "futureField": {"nested": 42}
        }"#;

        let settings: AppSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ui_settings["theme"], "dark");
        assert!(settings.extra.contains_key("futureField"));

        let round_tripped = serde_json::to_string(&settings).unwrap();
        assert!(round_tripped.contains("futureField"));
        assert!(round_tripped.contains("\"nested\":42"));
    }

    #[test]
    fn test_connection_status_serde() {
        let json = serde_json::to_string(&ConnectionStatus::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
        assert_eq!(ConnectionStatus::Inactive.to_string(), "inactive");
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Inactive);
    }

    #[test]
    fn test_backup_round_trip() {
        let backup = AdapterBackup {
            adapter_id: "{A1B2}".into(),
            interface_index: 12,
            name: "Ethernet".into(),
            ipv4_dns: vec![v4("8.8.8.8")],
            ipv6_dns: vec![],
            dhcp: false,
            captured_at: 1_700_000_000_000,
        };

        let json = serde_json::to_string(&backup).unwrap();
        assert!(json.contains("\"adapterId\""));
        assert!(json.contains("\"interfaceIndex\":12"));

        let parsed: AdapterBackup = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, backup);
    }
}
