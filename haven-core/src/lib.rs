//! # haven-core
//!
//! Shared core for the haven server: the lease data model, the in-process
//! event bus, the error taxonomy, write gating, and metrics. Every other
//! crate in the workspace builds on these types; none of them depend on
//! each other's internals.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use chrono;
pub use ipnet;
pub use pnet;
pub use tokio;
pub use tracing;

pub mod error;
pub mod event;
pub mod gate;
pub mod lease;
pub mod metrics;
pub mod prelude;

pub use error::Error;
pub use event::{Bus, Event, EventKind, EventOrigin};
pub use gate::{AlwaysWritable, WriteGate};
pub use lease::{Lease, LeaseState, RelayInfo};
