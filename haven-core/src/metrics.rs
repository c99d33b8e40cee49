#![allow(missing_docs)] // metric declarations don't need docstrings

//! # metrics
//!
//! process-wide counters and gauges. Exposition is the admin surface's
//! job; components only increment.
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    pub static ref ACTIVE_LEASES: IntGauge =
        register_int_gauge!("haven_active_leases", "number of live leases in the store").unwrap();
    pub static ref LEASE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "haven_lease_events_total",
        "lease state transitions by kind",
        &["kind"]
    )
    .unwrap();
    pub static ref EXPIRED_LEASES: IntCounter = register_int_counter!(
        "haven_expired_leases_total",
        "leases reaped by the expiry sweep"
    )
    .unwrap();

    pub static ref CONFLICTS_DETECTED: IntCounterVec = register_int_counter_vec!(
        "haven_conflicts_detected_total",
        "conflict records added by detection method",
        &["method"]
    )
    .unwrap();
    pub static ref PERMANENT_EXCLUSIONS: IntGauge = register_int_gauge!(
        "haven_permanent_exclusions",
        "addresses promoted to permanent exclusion"
    )
    .unwrap();
    pub static ref PROBES_SENT: IntCounterVec = register_int_counter_vec!(
        "haven_probes_sent_total",
        "wire probes sent by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref PROBE_CACHE_HITS: IntCounter = register_int_counter!(
        "haven_probe_cache_hits_total",
        "probe decisions answered from cache"
    )
    .unwrap();

    pub static ref BUS_PUBLISHED_EVENTS: IntCounter = register_int_counter!(
        "haven_bus_published_total",
        "events published on the internal bus"
    )
    .unwrap();
    pub static ref BUS_DROPPED_EVENTS: IntCounter = register_int_counter!(
        "haven_bus_dropped_total",
        "events dropped for slow subscribers or a full publish buffer"
    )
    .unwrap();

    pub static ref HA_STATE_CHANGES: IntCounterVec = register_int_counter_vec!(
        "haven_ha_state_changes_total",
        "HA state machine transitions",
        &["to"]
    )
    .unwrap();
    pub static ref HA_FRAMES_SENT: IntCounter =
        register_int_counter!("haven_ha_frames_sent_total", "peer link frames sent").unwrap();
    pub static ref HA_FRAMES_RECEIVED: IntCounter =
        register_int_counter!("haven_ha_frames_received_total", "peer link frames received")
            .unwrap();
    pub static ref HA_RECONNECTS: IntCounter = register_int_counter!(
        "haven_ha_reconnects_total",
        "peer link reconnect attempts"
    )
    .unwrap();

    pub static ref DNS_QUERIES: IntCounterVec = register_int_counter_vec!(
        "haven_dns_queries_total",
        "DNS queries by resolution path",
        &["path"]
    )
    .unwrap();
    pub static ref DNS_BLOCKED: IntCounter =
        register_int_counter!("haven_dns_blocked_total", "queries answered from blocklists")
            .unwrap();
    pub static ref DNS_UPSTREAM_FAILURES: IntCounter = register_int_counter!(
        "haven_dns_upstream_failures_total",
        "failed upstream forward attempts"
    )
    .unwrap();

    pub static ref RULE_MATCHES: IntCounterVec = register_int_counter_vec!(
        "haven_rule_matches_total",
        "port-automation rule matches by action",
        &["action"]
    )
    .unwrap();
}
