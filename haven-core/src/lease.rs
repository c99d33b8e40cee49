//! The lease data model.
//!
//! A [`Lease`] binds an IPv4 address to a client identity for a bounded
//! lifetime. The IP is the primary key; MAC, client-id and hostname each
//! index at most one live lease. `update_seq` is stamped by the store on
//! every mutation and is strictly monotonic process-wide.
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

/// Stored lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// created by DHCPOFFER, waiting for the client to request
    Offered,
    /// bound via DHCPACK
    Active,
    /// past expiry, kept only transiently before the GC removes it
    Expired,
    /// client reported the address in use (DHCPDECLINE)
    Declined,
    /// client released the address (DHCPRELEASE)
    Released,
}

impl LeaseState {
    /// states the expiry sweep is allowed to reap
    pub fn expirable(&self) -> bool {
        matches!(self, LeaseState::Active | LeaseState::Offered)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseState::Offered => "offered",
            LeaseState::Active => "active",
            LeaseState::Expired => "expired",
            LeaseState::Declined => "declined",
            LeaseState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Relay-agent information extracted from option 82.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// gateway IP the request was relayed through (giaddr)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub giaddr: Option<Ipv4Addr>,
    /// sub-option 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_id: Option<Vec<u8>>,
    /// sub-option 2
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<Vec<u8>>,
}

impl RelayInfo {
    /// true when no relay information was present on the request
    pub fn is_empty(&self) -> bool {
        self.giaddr.is_none() && self.circuit_id.is_none() && self.remote_id.is_none()
    }
}

/// A single IP lease. Serialised as JSON into the `leases` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Vec<u8>>,
    /// sanitised hostname, if the client supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    pub subnet: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub state: LeaseState,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// monotonic mutation sequence, re-stamped on every write
    pub update_seq: u64,
    /// per-lease DHCP options, code -> hex-encoded value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<u8, String>,
    #[serde(default, skip_serializing_if = "RelayInfo::is_empty")]
    pub relay: RelayInfo,
}

impl Lease {
    /// true once `now` has passed the lease expiry
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// key under which this lease is stored in the `leases` bucket
    pub fn key(&self) -> String {
        self.ip.to_string()
    }
}
