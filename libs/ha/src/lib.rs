//! # ha
//!
//! Two-node active/standby failover. The controller keeps a heartbeat
//! over an authenticated peer link, streams every lease mutation and
//! dynamic-config change to the peer, and gates local writes so only the
//! active node mutates state. Replication is last-writer-wins ordered by
//! the monotonic update sequence; claim epochs keep a rejoining node from
//! splitting the brain.
#![warn(rust_2018_idioms, unreachable_pub)]

mod controller;
mod link;
mod tls;

pub use controller::HaController;
pub use link::{PeerFrame, PeerIo, PeerLink, PeerSink, PeerSource};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use dynconfig::NodeRole;
use haven_core::event::ServerInfo;
use haven_core::prelude::*;

/// Runtime state of this node. Role-independent; only `Active` nodes
/// mutate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaState {
    Init,
    Active,
    Standby,
    Fault,
}

impl HaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaState::Init => "init",
            HaState::Active => "active",
            HaState::Standby => "standby",
            HaState::Fault => "fault",
        }
    }
}

impl std::fmt::Display for HaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable session state, mirrored to the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct HaStatus {
    pub role: NodeRole,
    pub state: HaState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_claim_reason: String,
    pub peer_connected: bool,
    pub last_error: Option<String>,
    pub epoch: u64,
}

struct HandleShared {
    status: RwLock<HaStatus>,
    redirect: String,
    standalone: bool,
    bus: Bus,
    node: String,
}

/// Cheap handle onto the HA session state. Implements [`WriteGate`]:
/// everything except `Active` refuses writes with the peer's URL.
#[derive(Clone)]
pub struct HaHandle {
    shared: Arc<HandleShared>,
}

impl std::fmt::Debug for HaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.shared.status.read();
        f.debug_struct("HaHandle")
            .field("state", &status.state)
            .field("role", &status.role)
            .finish()
    }
}

impl HaHandle {
    /// Handle for an HA pair member, starting in `init`.
    pub fn new(role: NodeRole, redirect: String, bus: Bus, node: String) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                status: RwLock::new(HaStatus {
                    role,
                    state: HaState::Init,
                    last_heartbeat: None,
                    last_claim_reason: String::new(),
                    peer_connected: false,
                    last_error: None,
                    epoch: 0,
                }),
                redirect,
                standalone: false,
                bus,
                node,
            }),
        }
    }

    /// Handle for a standalone deployment: permanently active.
    pub fn standalone(bus: Bus, node: String) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                status: RwLock::new(HaStatus {
                    role: NodeRole::Primary,
                    state: HaState::Active,
                    last_heartbeat: None,
                    last_claim_reason: "standalone".into(),
                    peer_connected: false,
                    last_error: None,
                    epoch: 0,
                }),
                redirect: String::new(),
                standalone: true,
                bus,
                node,
            }),
        }
    }

    pub fn status(&self) -> HaStatus {
        self.shared.status.read().clone()
    }

    pub fn state(&self) -> HaState {
        self.shared.status.read().state
    }

    pub fn role(&self) -> NodeRole {
        self.shared.status.read().role
    }

    pub fn epoch(&self) -> u64 {
        self.shared.status.read().epoch
    }

    pub fn is_active(&self) -> bool {
        self.shared.standalone || self.state() == HaState::Active
    }

    fn set_state(&self, to: HaState, reason: &str) {
        let from = {
            let mut status = self.shared.status.write();
            let from = status.state;
            if from == to {
                return;
            }
            status.state = to;
            if to == HaState::Active {
                status.last_claim_reason = reason.to_string();
            }
            from
        };
        info!(%from, %to, reason, "ha state change");
        metrics::HA_STATE_CHANGES
            .with_label_values(&[to.as_str()])
            .inc();
        self.shared.bus.publish(
            Event::server(
                EventKind::HaStateChange,
                ServerInfo {
                    node: self.shared.node.clone(),
                    state: Some(to.as_str().to_string()),
                },
                reason,
            ),
        );
    }

    fn set_epoch(&self, epoch: u64) {
        self.shared.status.write().epoch = epoch;
    }

    fn set_peer_connected(&self, connected: bool, error: Option<String>) {
        let mut status = self.shared.status.write();
        status.peer_connected = connected;
        if let Some(err) = error {
            status.last_error = Some(err);
        }
    }

    fn touch_heartbeat(&self) {
        self.shared.status.write().last_heartbeat = Some(Utc::now());
    }
}

impl WriteGate for HaHandle {
    fn ensure_writable(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::StandbyWrite {
                redirect: self.shared.redirect.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_is_always_writable() {
        let handle = HaHandle::standalone(Bus::new(), "solo".into());
        assert!(handle.ensure_writable().is_ok());
    }

    #[test]
    fn standby_rejects_with_redirect() {
        let handle = HaHandle::new(
            NodeRole::Secondary,
            "https://primary.lan:8443".into(),
            Bus::new(),
            "node-b".into(),
        );
        handle.set_state(HaState::Standby, "peer connected");
        match handle.ensure_writable() {
            Err(Error::StandbyWrite { redirect }) => {
                assert_eq!(redirect, "https://primary.lan:8443");
            }
            other => panic!("expected StandbyWrite, got {other:?}"),
        }
    }

    #[test]
    fn state_changes_update_claim_reason() {
        let handle = HaHandle::new(
            NodeRole::Primary,
            String::new(),
            Bus::new(),
            "node-a".into(),
        );
        handle.set_state(HaState::Active, "heartbeat timeout");
        let status = handle.status();
        assert_eq!(status.state, HaState::Active);
        assert_eq!(status.last_claim_reason, "heartbeat timeout");
    }
}
