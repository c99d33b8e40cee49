//! # conflict-detect
//!
//! Keeps leased addresses honest. Two cooperating halves:
//!
//! - the **prober** checks on the wire (ARP, optionally ICMP echo) that
//!   an address we are about to hand out is actually free, with a short
//!   result cache so one allocation decision never re-probes;
//! - the **table** is the durable book of addresses observed in use
//!   outside our allocation, with decaying counts, permanent-exclude
//!   promotion and a bounded resolved-history ring.
//!
//! The lease engine gates every offer through [`ConflictTable::is_conflicted`]
//! and records client DECLINEs through [`ConflictTable::add`].
#![warn(rust_2018_idioms, unreachable_pub)]

mod probe;
mod table;
pub mod wire;

pub use probe::{NullProber, ProbeEngine, ProbeOutcome, ProbeVia, Prober, StaticProber};
pub use table::{ConflictMethod, ConflictRecord, ConflictTable};
pub use wire::{ArpAnnouncer, NullAnnouncer};
