//! Typed dynamic-configuration sections.
//!
//! Each section is one JSON blob in its own bucket; replacement is the
//! only write operation. These types are shared by every component that
//! consumes configuration.
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

use ipnet::Ipv4Net;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

use haven_core::error::{Error, Result};

/// Static binding of a client identity to an IP within a subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    /// hex-encoded client identifier (option 61)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_time_secs: Option<u64>,
}

impl Reservation {
    pub fn matches(&self, client_id: Option<&[u8]>, mac: MacAddr) -> bool {
        if let (Some(want), Some(got)) = (&self.client_id, client_id) {
            if hex::decode(want).map(|w| w == got).unwrap_or(false) {
                return true;
            }
        }
        self.mac == Some(mac)
    }
}

/// A contiguous address range inside a subnet, with optional relay and
/// class match criteria. All specified criteria must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_time_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_id_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_class_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_class_regex: Option<String>,
}

impl Pool {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.start) && ip <= u32::from(self.end)
    }

    pub fn len(&self) -> usize {
        (u32::from(self.end) as usize).saturating_sub(u32::from(self.start) as usize) + 1
    }

    pub fn is_empty(&self) -> bool {
        u32::from(self.end) < u32::from(self.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }

    fn overlaps(&self, other: &Pool) -> bool {
        u32::from(self.start) <= u32::from(other.end) && u32::from(other.start) <= u32::from(self.end)
    }
}

/// One served subnet: CIDR, pools, reservations and option overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: Ipv4Net,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_time_secs: Option<u64>,
    /// per-subnet DHCP options, code -> hex value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<u8, String>,
    /// replaces the global sanitiser wholesale when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitizer: Option<SanitizerConfig>,
}

impl Subnet {
    pub fn validate(&self) -> Result<()> {
        for pool in &self.pools {
            if pool.is_empty() {
                return Err(Error::validation(format!(
                    "pool {} has start {} after end {}",
                    pool.name, pool.start, pool.end
                )));
            }
            if !self.cidr.contains(&pool.start) || !self.cidr.contains(&pool.end) {
                return Err(Error::validation(format!(
                    "pool {} ({}-{}) lies outside subnet {}",
                    pool.name, pool.start, pool.end, self.cidr
                )));
            }
        }
        for (i, a) in self.pools.iter().enumerate() {
            for b in &self.pools[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::validation(format!(
                        "pools {} and {} overlap in subnet {}",
                        a.name, b.name, self.cidr
                    )));
                }
            }
        }
        for res in &self.reservations {
            if !self.cidr.contains(&res.ip) {
                return Err(Error::validation(format!(
                    "reservation {} lies outside subnet {}",
                    res.ip, self.cidr
                )));
            }
            if res.mac.is_none() && res.client_id.is_none() {
                return Err(Error::validation(format!(
                    "reservation {} has neither mac nor client-id",
                    res.ip
                )));
            }
        }
        Ok(())
    }
}

/// Server-wide fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    /// default lease duration, 12 hours
    pub lease_time_secs: u64,
    pub authoritative: bool,
    /// announce assignments with gratuitous ARP after ACK
    pub gratuitous_arp: bool,
    pub lease_gc_interval_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            lease_time_secs: 43_200,
            authoritative: true,
            gratuitous_arp: false,
            lease_gc_interval_secs: 60,
        }
    }
}

/// Probe strategy for pre-assignment conflict checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    Sequential,
    Parallel,
}

/// Conflict-detection engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictParams {
    pub enabled: bool,
    pub probe_timeout_ms: u64,
    pub probe_cache_ttl_secs: u64,
    pub strategy: ProbeStrategy,
    pub parallel_probe_count: usize,
    pub max_probes_per_discover: usize,
    /// count at which a record is promoted to permanent
    pub max_conflict_count: u32,
    /// TTL for non-permanent records
    pub conflict_hold_time_secs: u64,
    pub icmp_fallback: bool,
    pub resolved_history: usize,
}

impl Default for ConflictParams {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_timeout_ms: 500,
            probe_cache_ttl_secs: 10,
            strategy: ProbeStrategy::Sequential,
            parallel_probe_count: 4,
            max_probes_per_discover: 10,
            max_conflict_count: 3,
            conflict_hold_time_secs: 3_600,
            icmp_fallback: false,
            resolved_history: 128,
        }
    }
}

/// A hook run on lease transitions (consumed by the hook runner
/// collaborator; stored and replicated here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub event: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// Dynamic-DNS updater settings (the updater itself is a collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdnsConfig {
    pub enabled: bool,
    pub domain: String,
    pub ttl_secs: u32,
    pub add_ptr: bool,
}

impl Default for DdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            domain: "lan".into(),
            ttl_secs: 300,
            add_ptr: true,
        }
    }
}

/// What a blocklist match answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockAction {
    Nxdomain,
    /// A -> 0.0.0.0, AAAA -> ::
    Zero,
    Refuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFormat {
    /// `0.0.0.0 name`
    Hosts,
    /// one name per line
    Domains,
    /// `||name^`
    Adblock,
}

/// A downloadable block- or allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlocklistSource {
    pub name: String,
    pub url: String,
    pub format: ListFormat,
    #[serde(default)]
    pub allow: bool,
    pub action: BlockAction,
    /// clamped to a minimum of 60 seconds
    pub refresh_secs: u64,
}

/// DNS proxy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsProxyConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub upstreams: Vec<String>,
    pub cache_min_ttl_secs: u32,
    pub cache_max_entries: usize,
    pub query_log_size: usize,
    #[serde(default)]
    pub blocklists: Vec<BlocklistSource>,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:53".parse().unwrap(),
            upstreams: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            cache_min_ttl_secs: 30,
            cache_max_entries: 10_000,
            query_log_size: 1_000,
            blocklists: Vec::new(),
        }
    }
}

/// Hostname sanitisation pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizerConfig {
    pub strip_emoji: bool,
    pub max_length: usize,
    #[serde(default)]
    pub deny_regexes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_regex: Option<String>,
    /// `{mac}` expands to the colon-less MAC
    pub fallback_template: String,
    pub dedupe: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            strip_emoji: true,
            max_length: 63,
            deny_regexes: Vec::new(),
            allow_regex: None,
            fallback_template: "dhcp-{mac}".into(),
            dedupe: true,
        }
    }
}

/// Device fingerprinting toggle (classifier is a collaborator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub enabled: bool,
}

/// Syslog shipping settings (the shipper is a collaborator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyslogConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
}

/// What a matched port-automation rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Webhook,
    Log,
    Tag,
}

/// A port-automation rule. All specified criteria must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRule {
    pub name: String,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_id_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id_regex: Option<String>,
    #[serde(default)]
    pub subnets: Vec<Ipv4Net>,
    #[serde(default)]
    pub device_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortRulesConfig {
    #[serde(default)]
    pub rules: Vec<PortRule>,
}

/// A floating address claimed by the active HA node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vip {
    pub address: Ipv4Net,
    pub interface: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VipsConfig {
    #[serde(default)]
    pub vips: Vec<Vip>,
}

/// An admin-surface user (authentication happens in the collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password_hash: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub users: Vec<User>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Subnet {
        Subnet {
            cidr: "192.168.1.0/24".parse().unwrap(),
            pools: vec![Pool {
                name: "main".into(),
                start: Ipv4Addr::new(192, 168, 1, 100),
                end: Ipv4Addr::new(192, 168, 1, 200),
                lease_time_secs: None,
                circuit_id_regex: None,
                remote_id_regex: None,
                vendor_class_regex: None,
                user_class_regex: None,
            }],
            reservations: vec![],
            lease_time_secs: None,
            options: BTreeMap::new(),
            sanitizer: None,
        }
    }

    #[test]
    fn valid_subnet_passes() {
        assert!(subnet().validate().is_ok());
    }

    #[test]
    fn pool_outside_subnet_rejected() {
        let mut s = subnet();
        s.pools[0].end = Ipv4Addr::new(192, 168, 2, 10);
        assert!(matches!(s.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn overlapping_pools_rejected() {
        let mut s = subnet();
        s.pools.push(Pool {
            name: "overlap".into(),
            start: Ipv4Addr::new(192, 168, 1, 150),
            end: Ipv4Addr::new(192, 168, 1, 220),
            lease_time_secs: None,
            circuit_id_regex: None,
            remote_id_regex: None,
            vendor_class_regex: None,
            user_class_regex: None,
        });
        assert!(matches!(s.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn reservation_needs_identity() {
        let mut s = subnet();
        s.reservations.push(Reservation {
            mac: None,
            client_id: None,
            ip: Ipv4Addr::new(192, 168, 1, 10),
            hostname: None,
            lease_time_secs: None,
        });
        assert!(s.validate().is_err());
    }

    #[test]
    fn reservation_matches_mac_and_id() {
        let res = Reservation {
            mac: Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
            client_id: Some("01aabbccddeeff".into()),
            ip: Ipv4Addr::new(192, 168, 1, 10),
            hostname: None,
            lease_time_secs: None,
        };
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let other: MacAddr = "00:00:00:00:00:01".parse().unwrap();
        assert!(res.matches(None, mac));
        assert!(res.matches(Some(&hex::decode("01aabbccddeeff").unwrap()), other));
        assert!(!res.matches(None, other));
    }

    #[test]
    fn pool_iteration() {
        let s = subnet();
        let ips: Vec<_> = s.pools[0].iter().take(3).collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(192, 168, 1, 100),
                Ipv4Addr::new(192, 168, 1, 101),
                Ipv4Addr::new(192, 168, 1, 102),
            ]
        );
        assert_eq!(s.pools[0].len(), 101);
    }
}
