//! The probe engine.
//!
//! Wraps a [`Prober`] (the wire-level ARP/ICMP implementation, or a
//! deterministic stand-in) with a short-lived result cache and the
//! sequential/parallel candidate-walk strategies the allocator uses.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use dynconfig::{ConflictParams, ProbeStrategy};
use haven_core::prelude::*;

use crate::table::{ConflictMethod, ConflictTable};

/// Which wire protocol produced an in-use verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVia {
    Arp,
    Icmp,
}

impl From<ProbeVia> for ConflictMethod {
    fn from(via: ProbeVia) -> Self {
        match via {
            ProbeVia::Arp => ConflictMethod::ArpProbe,
            ProbeVia::Icmp => ConflictMethod::IcmpProbe,
        }
    }
}

/// Result of probing one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// nothing answered within the timeout
    Free,
    /// something answered
    InUse {
        mac: Option<MacAddr>,
        via: ProbeVia,
    },
    /// the probe itself failed (socket error); never blocks allocation
    Unknown,
}

impl ProbeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Free => "free",
            ProbeOutcome::InUse { .. } => "in_use",
            ProbeOutcome::Unknown => "unknown",
        }
    }
}

/// The wire-level probe contract.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> ProbeOutcome;
}

/// Prober used when conflict detection is disabled: everything is free.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProber;

#[async_trait]
impl Prober for NullProber {
    async fn probe(&self, _ip: Ipv4Addr, _timeout: Duration) -> ProbeOutcome {
        ProbeOutcome::Free
    }
}

/// Deterministic prober backed by a fixed map. Addresses not present
/// probe free. Useful for exercising allocation behaviour off the wire.
#[derive(Debug, Default)]
pub struct StaticProber {
    map: RwLock<HashMap<Ipv4Addr, ProbeOutcome>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ip: Ipv4Addr, outcome: ProbeOutcome) {
        self.map.write().insert(ip, outcome);
    }

    pub fn clear(&self, ip: Ipv4Addr) {
        self.map.write().remove(&ip);
    }
}

#[async_trait]
impl Prober for StaticProber {
    async fn probe(&self, ip: Ipv4Addr, _timeout: Duration) -> ProbeOutcome {
        self.map
            .read()
            .get(&ip)
            .copied()
            .unwrap_or(ProbeOutcome::Free)
    }
}

/// Prober plus result cache plus candidate-walk strategy.
pub struct ProbeEngine {
    prober: Arc<dyn Prober>,
    params: RwLock<ConflictParams>,
    cache: RwLock<moka::future::Cache<Ipv4Addr, ProbeOutcome>>,
}

impl std::fmt::Debug for ProbeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeEngine").finish()
    }
}

fn build_cache(ttl_secs: u64) -> moka::future::Cache<Ipv4Addr, ProbeOutcome> {
    moka::future::CacheBuilder::new(10_000)
        .time_to_live(Duration::from_secs(ttl_secs.max(1)))
        .build()
}

impl ProbeEngine {
    pub fn new(prober: Arc<dyn Prober>, params: ConflictParams) -> Self {
        let cache = build_cache(params.probe_cache_ttl_secs);
        Self {
            prober,
            params: RwLock::new(params),
            cache: RwLock::new(cache),
        }
    }

    /// Apply refreshed parameters. The cache is rebuilt so the new TTL
    /// takes effect.
    pub fn set_params(&self, params: ConflictParams) {
        *self.cache.write() = build_cache(params.probe_cache_ttl_secs);
        *self.params.write() = params;
    }

    /// Probe one address, consulting the result cache first. `Unknown`
    /// results are not cached.
    pub async fn check(&self, ip: Ipv4Addr) -> ProbeOutcome {
        let params = self.params.read().clone();
        if !params.enabled {
            return ProbeOutcome::Free;
        }
        let cache = self.cache.read().clone();
        if let Some(hit) = cache.get(&ip) {
            metrics::PROBE_CACHE_HITS.inc();
            return hit;
        }
        let timeout = Duration::from_millis(params.probe_timeout_ms.max(1));
        let outcome = self.prober.probe(ip, timeout).await;
        metrics::PROBES_SENT.with_label_values(&[outcome.label()]).inc();
        if outcome != ProbeOutcome::Unknown {
            cache.insert(ip, outcome).await;
        }
        outcome
    }

    /// Walk `candidates` and return the first address that is neither
    /// conflicted nor observed in use on the wire. In-use hits are
    /// recorded in `table`; `max_probes_per_discover` caps how many wire
    /// probes one allocation decision may spend.
    pub async fn first_available(
        &self,
        table: &ConflictTable,
        subnet: Option<Ipv4Net>,
        candidates: impl Iterator<Item = Ipv4Addr>,
    ) -> Result<Option<Ipv4Addr>> {
        let params = self.params.read().clone();
        let mut budget = params.max_probes_per_discover.max(1);

        match params.strategy {
            ProbeStrategy::Sequential => {
                for ip in candidates {
                    if table.is_conflicted(ip) {
                        continue;
                    }
                    if budget == 0 {
                        debug!("probe budget exhausted for this allocation");
                        return Ok(None);
                    }
                    budget -= 1;
                    match self.check(ip).await {
                        ProbeOutcome::Free | ProbeOutcome::Unknown => return Ok(Some(ip)),
                        ProbeOutcome::InUse { mac, via } => {
                            table.add(ip, via.into(), mac, subnet)?;
                        }
                    }
                }
                Ok(None)
            }
            ProbeStrategy::Parallel => {
                let eligible: Vec<Ipv4Addr> =
                    candidates.filter(|ip| !table.is_conflicted(*ip)).collect();
                for chunk in eligible.chunks(params.parallel_probe_count.max(1)) {
                    if budget == 0 {
                        debug!("probe budget exhausted for this allocation");
                        return Ok(None);
                    }
                    let take = chunk.len().min(budget);
                    let chunk = &chunk[..take];
                    budget -= take;
                    let outcomes =
                        futures::future::join_all(chunk.iter().map(|&ip| self.check(ip))).await;
                    // first-free-wins in candidate order; every in-use
                    // hit in the chunk is recorded
                    let mut winner = None;
                    for (&ip, outcome) in chunk.iter().zip(outcomes) {
                        match outcome {
                            ProbeOutcome::Free | ProbeOutcome::Unknown => {
                                if winner.is_none() {
                                    winner = Some(ip);
                                }
                            }
                            ProbeOutcome::InUse { mac, via } => {
                                table.add(ip, via.into(), mac, subnet)?;
                            }
                        }
                    }
                    if winner.is_some() {
                        return Ok(winner);
                    }
                }
                Ok(None)
            }
        }
    }
}
