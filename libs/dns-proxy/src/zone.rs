//! The local authoritative zone, driven by lease events.
//!
//! Keyed by `(lowercased fqdn, record type)`. Lease registrations keep
//! an A and (optionally) a PTR record per client; a re-registration for
//! the same name and type replaces the previous records.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use haven_core::prelude::*;

use crate::records::{reverse_name, DnsRecord, RData, RecordType};

/// The zone map plus the lease-driven registration rules.
pub struct Zone {
    domain: String,
    default_ttl: u32,
    add_ptr: bool,
    records: RwLock<HashMap<(String, RecordType), Vec<DnsRecord>>>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("domain", &self.domain)
            .field("entries", &self.records.read().len())
            .finish()
    }
}

impl Zone {
    pub fn new(domain: impl Into<String>, default_ttl: u32, add_ptr: bool) -> Self {
        Self {
            domain: domain.into().to_lowercase(),
            default_ttl,
            add_ptr,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The FQDN a bare hostname registers under.
    pub fn fqdn(&self, hostname: &str) -> String {
        let hostname = hostname.to_lowercase();
        if self.domain.is_empty() || hostname.ends_with(&format!(".{}", self.domain)) {
            hostname
        } else {
            format!("{hostname}.{}", self.domain)
        }
    }

    /// Insert, replacing any existing records for (name, type).
    pub fn add(&self, record: DnsRecord) {
        let key = (record.name.clone(), record.rtype);
        self.records.write().insert(key, vec![record]);
    }

    /// Append to the record set for (name, type).
    pub fn add_multi(&self, record: DnsRecord) {
        let key = (record.name.clone(), record.rtype);
        self.records.write().entry(key).or_default().push(record);
    }

    /// Remove the whole record set for (name, type).
    pub fn remove(&self, name: &str, rtype: RecordType) -> bool {
        self.records
            .write()
            .remove(&(name.to_lowercase(), rtype))
            .is_some()
    }

    /// Remove one specific record by value, dropping the set if it
    /// becomes empty.
    pub fn remove_by_value(&self, name: &str, rtype: RecordType, rdata: &RData) -> bool {
        let key = (name.to_lowercase(), rtype);
        let mut records = self.records.write();
        let Some(set) = records.get_mut(&key) else {
            return false;
        };
        let before = set.len();
        set.retain(|r| &r.rdata != rdata);
        let removed = set.len() < before;
        if set.is_empty() {
            records.remove(&key);
        }
        removed
    }

    /// Records for (name, type), as copies. `ANY` returns every type
    /// under the name.
    pub fn lookup(&self, name: &str, rtype: RecordType) -> Vec<DnsRecord> {
        let name = name.to_lowercase();
        let records = self.records.read();
        if rtype == RecordType::Any {
            return records
                .iter()
                .filter(|((n, _), _)| *n == name)
                .flat_map(|(_, set)| set.iter().cloned())
                .collect();
        }
        records
            .get(&(name, rtype))
            .map(|set| set.to_vec())
            .unwrap_or_default()
    }

    /// True when the name belongs to our authoritative namespace.
    pub fn is_authoritative(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        (!self.domain.is_empty()
            && (name == self.domain || name.ends_with(&format!(".{}", self.domain))))
            || name.ends_with(".in-addr.arpa")
    }

    /// Register a lease: an A record for `hostname.<domain>` and, when
    /// enabled, the matching PTR. Replaces prior records for the name.
    pub fn register_lease(&self, hostname: &str, ip: Ipv4Addr) {
        let fqdn = self.fqdn(hostname);
        self.add(DnsRecord::a(&fqdn, ip, self.default_ttl));
        if self.add_ptr {
            self.add(DnsRecord::ptr(&reverse_name(ip), &fqdn, self.default_ttl));
        }
        debug!(%fqdn, %ip, "registered lease in zone");
    }

    /// Remove the A/PTR pair for a lease.
    pub fn unregister_lease(&self, hostname: &str, ip: Ipv4Addr) {
        let fqdn = self.fqdn(hostname);
        self.remove_by_value(&fqdn, RecordType::A, &RData::A(ip));
        self.remove(&reverse_name(ip), RecordType::Ptr);
        debug!(%fqdn, %ip, "unregistered lease from zone");
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// Subscribe the zone to lease traffic: ack/renew register, release/
/// expire/decline unregister. Runs until the bus closes or `cancel`
/// fires.
pub fn subscribe_lease_events(zone: Arc<Zone>, bus: &Bus, cancel: CancellationToken) {
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = sub.recv() => {
                    let Some(ev) = ev else { break };
                    let Some(lease) = &ev.lease else { continue };
                    let Some(hostname) = &lease.hostname else { continue };
                    match ev.kind {
                        EventKind::LeaseAck | EventKind::LeaseRenew => {
                            zone.register_lease(hostname, lease.ip);
                        }
                        EventKind::LeaseRelease
                        | EventKind::LeaseExpire
                        | EventKind::LeaseDecline => {
                            zone.unregister_lease(hostname, lease.ip);
                        }
                        _ => {}
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("zone lease subscriber stopped");
    });
}
