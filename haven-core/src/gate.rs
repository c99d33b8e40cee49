//! Write gating.
//!
//! Mutating surfaces (the DHCP service and the admin API) consult a
//! [`WriteGate`] before touching the lease engine or the config store.
//! The HA controller implements it; standalone deployments use
//! [`AlwaysWritable`].
use crate::error::{Error, Result};

/// Capability interface handed to mutating surfaces by construction.
pub trait WriteGate: Send + Sync {
    /// `Ok` when local writes are allowed, `Err(StandbyWrite)` otherwise.
    fn ensure_writable(&self) -> Result<()>;

    /// convenience predicate for paths that silently drop instead of erroring
    fn is_writable(&self) -> bool {
        self.ensure_writable().is_ok()
    }
}

/// Gate for standalone (non-HA) deployments: every write is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysWritable;

impl WriteGate for AlwaysWritable {
    fn ensure_writable(&self) -> Result<()> {
        Ok(())
    }
}

/// Gate that always refuses, used by tests exercising standby behaviour.
#[derive(Debug, Clone)]
pub struct NeverWritable {
    pub redirect: String,
}

impl WriteGate for NeverWritable {
    fn ensure_writable(&self) -> Result<()> {
        Err(Error::StandbyWrite {
            redirect: self.redirect.clone(),
        })
    }
}
