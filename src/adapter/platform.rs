//! Platform adapter operations
//!
//! The contract with the host is deliberately thin: *the adapter's
//! effective DNS list must equal the list we supplied, or the operation
//! fails observably*. Each platform fulfils it by shelling out to its
//! native administrative tooling and checking the exit status:
//!
//! - Windows: `netsh interface ipv4/ipv6 … dnsservers`, enumeration via
//!   PowerShell with JSON output, `ipconfig /flushdns`
//! - macOS: `networksetup`, `dscacheutil -flushcache`
//! - Linux: `resolvectl`
//!
//! Output parsing lives in platform-neutral helper functions so it is unit
//! tested on every host.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{AdapterKey, NetworkAdapter};
use crate::error::AdapterError;

/// Platform operations the controller is generic over
#[async_trait]
pub trait AdapterOps: Send + Sync {
    /// Enumerate adapters, excluding loopback and tunnel interfaces
    async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError>;

    /// Write static DNS lists to an adapter
    async fn set_dns(
        &self,
        adapter: &AdapterKey,
        ipv4: &[Ipv4Addr],
        ipv6: &[Ipv6Addr],
    ) -> Result<(), AdapterError>;

    /// Return an adapter to DHCP-assigned DNS
    async fn reset_dhcp(&self, adapter: &AdapterKey) -> Result<(), AdapterError>;

    /// Flush the OS resolver cache
    async fn flush_cache(&self) -> Result<(), AdapterError>;
}

/// The operations implementation for the current host
#[must_use]
pub fn native_ops() -> Arc<dyn AdapterOps> {
    #[cfg(windows)]
    {
        Arc::new(WindowsOps)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacOps)
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxOps)
    }
    #[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
    {
        Arc::new(UnsupportedOps)
    }
}

/// Run a platform command, failing observably on a non-zero exit
async fn run(program: &str, args: &[&str]) -> Result<String, AdapterError> {
    debug!(program, ?args, "running platform command");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| AdapterError::CommandIo {
            command: program.to_string(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(AdapterError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Interface names that are never takeover targets
fn is_excluded_interface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "lo"
        || lower.contains("loopback")
        || lower.starts_with("tun")
        || lower.starts_with("tap")
        || lower.starts_with("wg")
        || lower.starts_with("utun")
        || lower.contains("tunnel")
}

// ============================================================================
// Linux (systemd-resolved)
// ============================================================================

/// Parse `resolvectl dns` output into (index, name, servers) triples
///
/// Lines look like `Link 2 (enp1s0): 192.168.1.1 fd00::1`; the `Global:`
/// line and links without servers are skipped by the caller as needed.
pub fn parse_resolvectl_dns(output: &str) -> Vec<(u32, String, Vec<IpAddr>)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("Link ")?;
            let (index_str, rest) = rest.split_once(" (")?;
            let (name, servers) = rest.split_once("):")?;
            let index = index_str.trim().parse().ok()?;
            let ips = servers
                .split_whitespace()
                .filter_map(|s| s.parse().ok())
                .collect();
            Some((index, name.trim().to_string(), ips))
        })
        .collect()
}

#[cfg(target_os = "linux")]
struct LinuxOps;

#[cfg(target_os = "linux")]
#[async_trait]
impl AdapterOps for LinuxOps {
    async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
        let output = run("resolvectl", &["dns"]).await.map_err(|e| {
            AdapterError::EnumerationFailed { reason: e.to_string() }
        })?;

        Ok(parse_resolvectl_dns(&output)
            .into_iter()
            .filter(|(_, name, _)| !is_excluded_interface(name))
            .map(|(index, name, servers)| {
                let ipv4_dns = servers
                    .iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                let ipv6_dns = servers
                    .iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V6(v6) => Some(*v6),
                        IpAddr::V4(_) => None,
                    })
                    .collect();
                NetworkAdapter {
                    id: name.clone(),
                    interface_index: index,
                    name,
                    description: None,
                    connected: true,
                    // resolvectl does not expose the DHCP origin; restore
                    // rewrites the captured lists instead of reverting.
                    dhcp: false,
                    ipv4_dns,
                    ipv6_dns,
                }
            })
            .collect())
    }

    async fn set_dns(
        &self,
        adapter: &AdapterKey,
        ipv4: &[Ipv4Addr],
        ipv6: &[Ipv6Addr],
    ) -> Result<(), AdapterError> {
        let mut args = vec!["dns".to_string(), adapter.name.clone()];
        args.extend(ipv4.iter().map(ToString::to_string));
        args.extend(ipv6.iter().map(ToString::to_string));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run("resolvectl", &arg_refs).await.map_err(|e| {
            AdapterError::ApplyFailed {
                adapter: adapter.name.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn reset_dhcp(&self, adapter: &AdapterKey) -> Result<(), AdapterError> {
        run("resolvectl", &["revert", &adapter.name])
            .await
            .map_err(|e| AdapterError::ApplyFailed {
                adapter: adapter.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), AdapterError> {
        run("resolvectl", &["flush-caches"])
            .await
            .map_err(|e| AdapterError::FlushFailed { reason: e.to_string() })?;
        Ok(())
    }
}

// ============================================================================
// macOS (networksetup)
// ============================================================================

/// Parse `networksetup -getdnsservers` output
///
/// Returns `None` when DNS is DHCP-assigned (networksetup prints a prose
/// sentence instead of addresses).
pub fn parse_networksetup_dns(output: &str) -> Option<Vec<IpAddr>> {
    if output.contains("There aren't any DNS Servers set") {
        return None;
    }
    Some(
        output
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
    )
}

/// Parse `networksetup -listallnetworkservices` output
///
/// The first line is a banner; a leading `*` marks a disabled service.
pub fn parse_network_services(output: &str) -> Vec<(String, bool)> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let disabled = line.starts_with('*');
            (line.trim_start_matches('*').trim().to_string(), !disabled)
        })
        .collect()
}

#[cfg(target_os = "macos")]
struct MacOps;

#[cfg(target_os = "macos")]
#[async_trait]
impl AdapterOps for MacOps {
    async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
        let services = run("networksetup", &["-listallnetworkservices"])
            .await
            .map_err(|e| AdapterError::EnumerationFailed { reason: e.to_string() })?;

        let mut adapters = Vec::new();
        for (index, (service, enabled)) in parse_network_services(&services)
            .into_iter()
            .filter(|(name, _)| !is_excluded_interface(name))
            .enumerate()
        {
            let dns_output = run("networksetup", &["-getdnsservers", &service])
                .await
                .unwrap_or_default();
            let servers = parse_networksetup_dns(&dns_output);
            let dhcp = servers.is_none();
            let servers = servers.unwrap_or_default();

            #[allow(clippy::cast_possible_truncation)]
            adapters.push(NetworkAdapter {
                id: service.clone(),
                interface_index: index as u32,
                name: service,
                description: None,
                connected: enabled,
                dhcp,
                ipv4_dns: servers
                    .iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect(),
                ipv6_dns: servers
                    .iter()
                    .filter_map(|ip| match ip {
                        IpAddr::V6(v6) => Some(*v6),
                        IpAddr::V4(_) => None,
                    })
                    .collect(),
            });
        }
        Ok(adapters)
    }

    async fn set_dns(
        &self,
        adapter: &AdapterKey,
        ipv4: &[Ipv4Addr],
        ipv6: &[Ipv6Addr],
    ) -> Result<(), AdapterError> {
        let mut args = vec!["-setdnsservers".to_string(), adapter.name.clone()];
        args.extend(ipv4.iter().map(ToString::to_string));
        args.extend(ipv6.iter().map(ToString::to_string));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run("networksetup", &arg_refs)
            .await
            .map_err(|e| AdapterError::ApplyFailed {
                adapter: adapter.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn reset_dhcp(&self, adapter: &AdapterKey) -> Result<(), AdapterError> {
        run("networksetup", &["-setdnsservers", &adapter.name, "Empty"])
            .await
            .map_err(|e| AdapterError::ApplyFailed {
                adapter: adapter.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), AdapterError> {
        run("dscacheutil", &["-flushcache"])
            .await
            .map_err(|e| AdapterError::FlushFailed { reason: e.to_string() })?;
        run("killall", &["-HUP", "mDNSResponder"])
            .await
            .map_err(|e| AdapterError::FlushFailed { reason: e.to_string() })?;
        Ok(())
    }
}

// ============================================================================
// Windows (netsh + PowerShell)
// ============================================================================

/// Shape of the PowerShell enumeration output
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsAdapter {
    interface_guid: Option<String>,
    if_index: u32,
    name: String,
    interface_description: Option<String>,
    status: Option<String>,
    ipv4_servers: Option<Vec<String>>,
    ipv6_servers: Option<Vec<String>>,
    dhcp: Option<bool>,
}

/// PowerShell script producing one JSON array of adapters with their DNS
pub const PS_ENUMERATE: &str = r#"
$out = Get-NetAdapter | Where-Object { -not $_.Virtual } | ForEach-Object {
    $v4 = (Get-DnsClientServerAddress -InterfaceIndex $_.ifIndex -AddressFamily IPv4 -ErrorAction SilentlyContinue).ServerAddresses
    $v6 = (Get-DnsClientServerAddress -InterfaceIndex $_.ifIndex -AddressFamily IPv6 -ErrorAction SilentlyContinue).ServerAddresses
    $dhcp = (Get-NetIPInterface -InterfaceIndex $_.ifIndex -AddressFamily IPv4 -ErrorAction SilentlyContinue).Dhcp -eq 'Enabled'
    [pscustomobject]@{
        InterfaceGuid = $_.InterfaceGuid
        IfIndex = $_.ifIndex
        Name = $_.Name
        InterfaceDescription = $_.InterfaceDescription
        Status = [string]$_.Status
        Ipv4Servers = @($v4)
        Ipv6Servers = @($v6)
        Dhcp = $dhcp
    }
}
ConvertTo-Json -InputObject @($out) -Depth 3
"#;

/// Convert the PowerShell JSON payload into adapters
pub fn parse_windows_adapters(json: &str) -> Result<Vec<NetworkAdapter>, AdapterError> {
    let raw: Vec<PsAdapter> = serde_json::from_str(json).map_err(|e| {
        AdapterError::EnumerationFailed {
            reason: format!("unexpected enumeration output: {e}"),
        }
    })?;

    Ok(raw
        .into_iter()
        .filter(|a| !is_excluded_interface(&a.name))
        .map(|a| NetworkAdapter {
            id: a.interface_guid.unwrap_or_else(|| a.name.clone()),
            interface_index: a.if_index,
            name: a.name,
            description: a.interface_description,
            connected: a.status.as_deref() == Some("Up"),
            dhcp: a.dhcp.unwrap_or(false),
            ipv4_dns: a
                .ipv4_servers
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            ipv6_dns: a
                .ipv6_servers
                .unwrap_or_default()
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        })
        .collect())
}

#[cfg(windows)]
struct WindowsOps;

#[cfg(windows)]
#[async_trait]
impl AdapterOps for WindowsOps {
    async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
        let json = run("powershell", &["-NoProfile", "-Command", PS_ENUMERATE])
            .await
            .map_err(|e| AdapterError::EnumerationFailed { reason: e.to_string() })?;
        parse_windows_adapters(&json)
    }

    async fn set_dns(
        &self,
        adapter: &AdapterKey,
        ipv4: &[Ipv4Addr],
        ipv6: &[Ipv6Addr],
    ) -> Result<(), AdapterError> {
        let name_arg = format!("name={}", adapter.interface_index);
        let apply = |e: AdapterError| AdapterError::ApplyFailed {
            adapter: adapter.name.clone(),
            reason: e.to_string(),
        };

        for (family, addrs) in [
            ("ipv4", ipv4.iter().map(ToString::to_string).collect::<Vec<_>>()),
            ("ipv6", ipv6.iter().map(ToString::to_string).collect::<Vec<_>>()),
        ] {
            match addrs.split_first() {
                Some((first, rest)) => {
                    run(
                        "netsh",
                        &[
                            "interface", family, "set", "dnsservers", &name_arg, "static", first,
                            "primary", "validate=no",
                        ],
                    )
                    .await
                    .map_err(apply)?;

                    for (i, addr) in rest.iter().enumerate() {
                        let index = format!("index={}", i + 2);
                        run(
                            "netsh",
                            &[
                                "interface", family, "add", "dnsservers", &name_arg, addr, &index,
                                "validate=no",
                            ],
                        )
                        .await
                        .map_err(apply)?;
                    }
                }
                None => {
                    // No server of this family in the list: clear the slot
                    run(
                        "netsh",
                        &["interface", family, "set", "dnsservers", &name_arg, "static", "none"],
                    )
                    .await
                    .map_err(apply)?;
                }
            }
        }
        Ok(())
    }

    async fn reset_dhcp(&self, adapter: &AdapterKey) -> Result<(), AdapterError> {
        let name_arg = format!("name={}", adapter.interface_index);
        for family in ["ipv4", "ipv6"] {
            run("netsh", &["interface", family, "set", "dnsservers", &name_arg, "dhcp"])
                .await
                .map_err(|e| AdapterError::ApplyFailed {
                    adapter: adapter.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn flush_cache(&self) -> Result<(), AdapterError> {
        run("ipconfig", &["/flushdns"])
            .await
            .map_err(|e| AdapterError::FlushFailed { reason: e.to_string() })?;
        Ok(())
    }
}

// ============================================================================
// Fallback
// ============================================================================

#[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
struct UnsupportedOps;

#[cfg(not(any(windows, target_os = "macos", target_os = "linux")))]
#[async_trait]
impl AdapterOps for UnsupportedOps {
    async fn list(&self) -> Result<Vec<NetworkAdapter>, AdapterError> {
        Err(AdapterError::Unsupported)
    }

    async fn set_dns(
        &self,
        _adapter: &AdapterKey,
        _ipv4: &[Ipv4Addr],
        _ipv6: &[Ipv6Addr],
    ) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    async fn reset_dhcp(&self, _adapter: &AdapterKey) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }

    async fn flush_cache(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Interface Filter Tests
    // ========================================================================

    #[test]
    fn test_excluded_interfaces() {
        assert!(is_excluded_interface("lo"));
        assert!(is_excluded_interface("Loopback Pseudo-Interface 1"));
        assert!(is_excluded_interface("tun0"));
        assert!(is_excluded_interface("wg-home"));
        assert!(is_excluded_interface("utun4"));
        assert!(is_excluded_interface("Teredo Tunneling Adapter"));

        assert!(!is_excluded_interface("eth0"));
        assert!(!is_excluded_interface("Wi-Fi"));
        assert!(!is_excluded_interface("Ethernet 2"));
    }

    // ========================================================================
    // resolvectl Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_resolvectl_dns() {
        let output = "\
Global:
Link 2 (enp1s0): 192.168.1.1 8.8.8.8
Link 3 (wlp2s0):
Link 7 (wg0): 10.0.0.1
";
        let links = parse_resolvectl_dns(output);
        assert_eq!(links.len(), 3);

        assert_eq!(links[0].0, 2);
        assert_eq!(links[0].1, "enp1s0");
        assert_eq!(links[0].2.len(), 2);

        assert_eq!(links[1].1, "wlp2s0");
        assert!(links[1].2.is_empty());
    }

    #[test]
    fn test_parse_resolvectl_dns_mixed_families() {
        let output = "Link 2 (eth0): 1.1.1.1 2606:4700:4700::1111\n";
        let links = parse_resolvectl_dns(output);
        assert_eq!(links[0].2.len(), 2);
        assert!(links[0].2[0].is_ipv4());
        assert!(links[0].2[1].is_ipv6());
    }

    // ========================================================================
    // networksetup Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_networksetup_dns_static() {
        let output = "8.8.8.8\n8.8.4.4\n";
        let servers = parse_networksetup_dns(output).unwrap();
        assert_eq!(servers.len(), 2);
    }

    #[test]
    fn test_parse_networksetup_dns_dhcp() {
        let output = "There aren't any DNS Servers set on Wi-Fi.\n";
        assert!(parse_networksetup_dns(output).is_none());
    }

    #[test]
    fn test_parse_network_services() {
        let output = "\
An asterisk (*) denotes that a network service is disabled.
Wi-Fi
*Thunderbolt Bridge
USB 10/100/1000 LAN
";
        let services = parse_network_services(output);
        assert_eq!(services.len(), 3);
        assert_eq!(services[0], ("Wi-Fi".to_string(), true));
        assert_eq!(services[1], ("Thunderbolt Bridge".to_string(), false));
        assert_eq!(services[2], ("USB 10/100/1000 LAN".to_string(), true));
    }

    // ========================================================================
    // Windows Enumeration Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_windows_adapters() {
        let json = r#"[
            {
                "InterfaceGuid": "{11111111-2222-3333-4444-555555555555}",
                "IfIndex": 12,
                "Name": "Ethernet",
                "InterfaceDescription": "Intel(R) Ethernet Connection",
                "Status": "Up",
                "Ipv4Servers": ["8.8.8.8", "8.8.4.4"],
                "Ipv6Servers": [],
                "Dhcp": false
            },
            {
                "InterfaceGuid": "{66666666-7777-8888-9999-000000000000}",
                "IfIndex": 19,
                "Name": "Teredo Tunneling Adapter",
                "InterfaceDescription": null,
                "Status": "Disconnected",
                "Ipv4Servers": [],
                "Ipv6Servers": [],
                "Dhcp": true
            }
        ]"#;

        let adapters = parse_windows_adapters(json).unwrap();
        // The tunnel adapter is filtered
        assert_eq!(adapters.len(), 1);
        let eth = &adapters[0];
        assert_eq!(eth.interface_index, 12);
        assert!(eth.connected);
        assert!(!eth.dhcp);
        assert_eq!(eth.ipv4_dns.len(), 2);
    }

    #[test]
    fn test_parse_windows_adapters_garbage() {
        assert!(parse_windows_adapters("not json").is_err());
    }
}
