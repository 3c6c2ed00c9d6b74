//! Shipped provider presets
//!
//! Every preset carries a fixed identifier so documents written by older
//! releases keep referring to the same entries. Do not reuse or renumber
//! these IDs.

use std::net::IpAddr;

use uuid::{uuid, Uuid};

use super::types::{Provider, ProviderKind};

/// Cloudflare classical (1.1.1.1)
pub const CLOUDFLARE_STANDARD: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e01");
/// Cloudflare `DoH`
pub const CLOUDFLARE_DOH: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e02");
/// Google classical (8.8.8.8)
pub const GOOGLE_STANDARD: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e03");
/// Google `DoH`
pub const GOOGLE_DOH: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e04");
/// Quad9 classical (9.9.9.9)
pub const QUAD9_STANDARD: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e05");
/// Quad9 `DoH`
pub const QUAD9_DOH: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e06");
/// OpenDNS classical
pub const OPENDNS_STANDARD: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e07");
/// OpenDNS `DoH`
pub const OPENDNS_DOH: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e08");
/// AdGuard classical
pub const ADGUARD_STANDARD: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e09");
/// AdGuard `DoH`
pub const ADGUARD_DOH: Uuid = uuid!("8f4a2c1e-0d5b-4f7a-9c3e-1a6b8d2f4e0a");

fn preset(
    id: Uuid,
    name: &str,
    description: &str,
    kind: ProviderKind,
) -> Provider {
    Provider {
        id,
        name: name.into(),
        description: Some(description.into()),
        built_in: true,
        kind,
    }
}

fn standard(
    primary_ipv4: &str,
    secondary_ipv4: &str,
    primary_ipv6: &str,
    secondary_ipv6: &str,
) -> ProviderKind {
    ProviderKind::Standard {
        primary_ipv4: Some(primary_ipv4.parse().expect("preset IPv4")),
        secondary_ipv4: Some(secondary_ipv4.parse().expect("preset IPv4")),
        primary_ipv6: Some(primary_ipv6.parse().expect("preset IPv6")),
        secondary_ipv6: Some(secondary_ipv6.parse().expect("preset IPv6")),
    }
}

fn doh(url: &str, bootstrap: &[&str]) -> ProviderKind {
    ProviderKind::DoH {
        url: url.into(),
        bootstrap_ips: bootstrap
            .iter()
            .map(|ip| ip.parse::<IpAddr>().expect("preset bootstrap IP"))
            .collect(),
    }
}

/// The full built-in provider catalogue
///
/// Used to seed a fresh settings document and to re-seed after a load
/// failure.
#[must_use]
pub fn catalogue() -> Vec<Provider> {
    vec![
        preset(
            CLOUDFLARE_STANDARD,
            "Cloudflare",
            "Cloudflare public DNS (1.1.1.1)",
            standard("1.1.1.1", "1.0.0.1", "2606:4700:4700::1111", "2606:4700:4700::1001"),
        ),
        preset(
            CLOUDFLARE_DOH,
            "Cloudflare (DoH)",
            "Cloudflare DNS over HTTPS",
            doh("https://cloudflare-dns.com/dns-query", &["1.1.1.1", "1.0.0.1"]),
        ),
        preset(
            GOOGLE_STANDARD,
            "Google",
            "Google public DNS (8.8.8.8)",
            standard("8.8.8.8", "8.8.4.4", "2001:4860:4860::8888", "2001:4860:4860::8844"),
        ),
        preset(
            GOOGLE_DOH,
            "Google (DoH)",
            "Google DNS over HTTPS",
            doh("https://dns.google/dns-query", &["8.8.8.8", "8.8.4.4"]),
        ),
        preset(
            QUAD9_STANDARD,
            "Quad9",
            "Quad9 with threat blocking (9.9.9.9)",
            standard("9.9.9.9", "149.112.112.112", "2620:fe::fe", "2620:fe::9"),
        ),
        preset(
            QUAD9_DOH,
            "Quad9 (DoH)",
            "Quad9 DNS over HTTPS",
            doh("https://dns.quad9.net/dns-query", &["9.9.9.9", "149.112.112.112"]),
        ),
        preset(
            OPENDNS_STANDARD,
            "OpenDNS",
            "Cisco OpenDNS",
            standard("208.67.222.222", "208.67.220.220", "2620:119:35::35", "2620:119:53::53"),
        ),
        preset(
            OPENDNS_DOH,
            "OpenDNS (DoH)",
            "Cisco OpenDNS over HTTPS",
            doh("https://doh.opendns.com/dns-query", &["208.67.222.222", "208.67.220.220"]),
        ),
        preset(
            ADGUARD_STANDARD,
            "AdGuard",
            "AdGuard ad-blocking DNS",
            standard("94.140.14.14", "94.140.15.15", "2a10:50c0::ad1:ff", "2a10:50c0::ad2:ff"),
        ),
        preset(
            ADGUARD_DOH,
            "AdGuard (DoH)",
            "AdGuard ad-blocking DNS over HTTPS",
            doh("https://dns.adguard-dns.com/dns-query", &["94.140.14.14", "94.140.15.15"]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_ids_stable_and_unique() {
        let providers = catalogue();
        assert_eq!(providers.len(), 10);

        let ids: HashSet<Uuid> = providers.iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), providers.len(), "preset IDs must be unique");

        // Spot-check that IDs do not drift between builds
        assert!(ids.contains(&CLOUDFLARE_STANDARD));
        assert!(ids.contains(&ADGUARD_DOH));
    }

    #[test]
    fn test_catalogue_all_valid() {
        for provider in catalogue() {
            provider.validate().unwrap();
            assert!(provider.built_in);
            assert!(provider.description.is_some());
        }
    }

    #[test]
    fn test_catalogue_pairs() {
        let providers = catalogue();
        let doh_count = providers.iter().filter(|p| p.is_doh()).count();
        assert_eq!(doh_count, 5);
        assert_eq!(providers.len() - doh_count, 5);
    }

    #[test]
    fn test_doh_presets_carry_bootstraps() {
        for provider in catalogue().into_iter().filter(Provider::is_doh) {
            if let crate::settings::ProviderKind::DoH { bootstrap_ips, url } = &provider.kind {
                assert!(url.starts_with("https://"));
                assert!(!bootstrap_ips.is_empty(), "{} needs bootstrap IPs", provider.name);
            }
        }
    }
}
