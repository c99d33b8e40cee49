//! # lease-engine
//!
//! The lease state machine: offer, confirm, renew, release, decline and
//! expiry over the durable store, gated by the conflict engine. Every
//! mutation draws a fresh update sequence, persists, refreshes the
//! in-memory indices and publishes exactly one event on the bus.
//!
//! [`service`] layers the DHCPv4 message handling (DISCOVER, REQUEST,
//! RELEASE, DECLINE, INFORM) on top of the engine; the wire codec itself
//! is `dhcproto`.
#![warn(rust_2018_idioms, unreachable_pub)]

mod engine;
pub mod service;

pub use engine::{run_gc, ClientView, LeaseEngine, OFFER_HOLD};
pub use service::{DhcpService, RequestMeta};
