//! # dns-proxy
//!
//! The embedded DNS side of the server: a local authoritative zone fed
//! by lease events, an upstream forwarder with health-ranked server
//! selection, a TTL response cache, downloadable block/allow lists, and
//! a live query log. UDP and TCP listeners run one stateless handler
//! task per request.
#![warn(rust_2018_idioms, unreachable_pub)]

pub mod blocklist;
pub mod cache;
pub mod forwarder;
pub mod query_log;
pub mod records;
pub mod server;
pub mod wire;
pub mod zone;

pub use blocklist::{parse_list, run_refresher, Blocklists};
pub use cache::ResponseCache;
pub use forwarder::{run_health_probe, Forwarder};
pub use query_log::{QueryDisposition, QueryLog, QueryLogEntry};
pub use records::{reverse_name, DnsRecord, RData, RecordType};
pub use server::{run_tcp, run_udp, DnsServer};
pub use zone::{subscribe_lease_events, Zone};

use std::sync::Arc;
use std::time::Duration;

use dynconfig::DnsProxyConfig;

/// Assemble a [`DnsServer`] from the dynamic config section. The
/// listeners and background loops are spawned by the caller.
pub fn build(cfg: &DnsProxyConfig, domain: &str, ttl: u32, add_ptr: bool) -> Arc<DnsServer> {
    Arc::new(DnsServer {
        zone: Arc::new(Zone::new(domain, ttl, add_ptr)),
        cache: Arc::new(ResponseCache::new(
            cfg.cache_max_entries,
            Duration::from_secs(cfg.cache_min_ttl_secs as u64),
        )),
        forwarder: Arc::new(Forwarder::new(&cfg.upstreams, Duration::from_secs(2))),
        blocklists: Arc::new(Blocklists::new(cfg.blocklists.clone())),
        log: Arc::new(QueryLog::new(cfg.query_log_size.max(1))),
    })
}
