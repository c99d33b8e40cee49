//! Error taxonomy shared across the workspace.
//!
//! Errors cross component boundaries unchanged; only the outermost API
//! surface maps them to user-visible strings and status codes.
use std::net::Ipv4Addr;

use thiserror::Error;

/// Typed failure surfaced by every mutating operation in the core.
#[derive(Error, Debug)]
pub enum Error {
    /// underlying database I/O or corruption. Fatal for the current
    /// operation, the process continues.
    #[error("storage failure: {0}")]
    Storage(String),
    /// malformed input (bad CIDR, bad MAC, pool outside subnet, overlap)
    #[error("validation failed: {0}")]
    Validation(String),
    /// the allocator exhausted every eligible pool
    #[error("no address available in any eligible pool")]
    NoAddressAvailable,
    /// a probe hit or the conflict table gated the address
    #[error("address conflict detected for {0}")]
    ConflictDetected(Ipv4Addr),
    /// write rejected because this node is HA standby
    #[error("node is standby, writes are served by {redirect}")]
    StandbyWrite {
        /// the active peer's URL, for redirection
        redirect: String,
    },
    /// the HA peer link was down when a synchronous operation required it
    #[error("ha peer unavailable: {0}")]
    PeerUnavailable(String),
    /// lookup miss for a specified IP/MAC/hostname
    #[error("not found: {0}")]
    NotFound(String),
    /// carried through from the external surface, never generated here
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl Error {
    /// shorthand used by the storage layer to wrap backend errors
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Error::Storage(err.to_string())
    }

    /// shorthand for validation failures
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
