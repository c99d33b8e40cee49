//! haven prelude

pub use crate::{
    error::{Error, Result},
    event::{Bus, Event, EventKind, EventOrigin, ServerInfo, Subscription},
    gate::{AlwaysWritable, WriteGate},
    lease::{Lease, LeaseState, RelayInfo},
    metrics,
};

pub use chrono::{DateTime, Utc};
pub use ipnet::Ipv4Net;
pub use pnet::util::MacAddr;
pub use tracing::{self, debug, error, info, instrument, trace, warn};

pub use std::{net::Ipv4Addr, sync::Arc};
