//! In-process event bus.
//!
//! A single broadcast pipeline: publishers enqueue onto a bounded channel,
//! a dispatcher task fans out to per-subscriber bounded channels. A slow
//! subscriber only ever loses its own events; the publisher never blocks.
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::lease::Lease;
use crate::metrics;

/// Default depth of the publish channel.
pub const DEFAULT_BUS_BUFFER: usize = 10_000;
/// Default depth of each subscriber channel.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 500;

/// Which side of the HA pair caused a mutation. Peer-originated events are
/// applied locally but never replicated back (no echo).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    Local,
    Peer,
}

/// Tagged event kind, the wire names match the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "lease.offer")]
    LeaseOffer,
    #[serde(rename = "lease.ack")]
    LeaseAck,
    #[serde(rename = "lease.renew")]
    LeaseRenew,
    #[serde(rename = "lease.release")]
    LeaseRelease,
    #[serde(rename = "lease.decline")]
    LeaseDecline,
    #[serde(rename = "lease.expire")]
    LeaseExpire,
    #[serde(rename = "conflict.detected")]
    ConflictDetected,
    #[serde(rename = "conflict.resolved")]
    ConflictResolved,
    #[serde(rename = "server.started")]
    ServerStarted,
    #[serde(rename = "server.stopping")]
    ServerStopping,
    #[serde(rename = "ha.state_change")]
    HaStateChange,
}

impl EventKind {
    /// lease kinds that create or refresh a lease
    pub fn is_lease_upsert(&self) -> bool {
        matches!(
            self,
            EventKind::LeaseOffer | EventKind::LeaseAck | EventKind::LeaseRenew
        )
    }

    /// lease kinds that remove a lease
    pub fn is_lease_removal(&self) -> bool {
        matches!(
            self,
            EventKind::LeaseRelease | EventKind::LeaseDecline | EventKind::LeaseExpire
        )
    }
}

/// Server-level payload for `server.*` and `ha.state_change` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// A published event. Payloads are cloned on publish; subscribers own
/// their copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub origin: EventOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Event {
    pub fn lease(kind: EventKind, lease: Lease, origin: EventOrigin) -> Self {
        Self {
            kind,
            at: Utc::now(),
            origin,
            lease: Some(lease),
            server: None,
            reason: String::new(),
        }
    }

    pub fn server(kind: EventKind, info: ServerInfo, reason: impl Into<String>) -> Self {
        Self {
            kind,
            at: Utc::now(),
            origin: EventOrigin::Local,
            lease: None,
            server: Some(info),
            reason: reason.into(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

struct SubscriberHandle {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    tx: mpsc::Sender<Event>,
    // consumed by `start`
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    subs: RwLock<HashMap<u64, SubscriberHandle>>,
    next_id: AtomicU64,
    publish_dropped: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to the bus. Cheap to clone, shared by every component.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.inner.subs.read().len())
            .finish()
    }
}

/// A registered subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    bus: Weak<BusInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Receive the next event. Returns `None` once the bus has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Number of events dropped for this subscriber because its channel
    /// was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subs.write().remove(&self.id);
        }
    }
}

impl Bus {
    /// Create a bus with the default publish buffer.
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUS_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            inner: Arc::new(BusInner {
                tx,
                rx: Mutex::new(Some(rx)),
                subs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                publish_dropped: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the dispatcher task. Must be called once, on a runtime.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let mut rx = inner
            .rx
            .lock()
            .take()
            .expect("bus dispatcher already started");
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = rx.recv() => {
                        let Some(ev) = ev else { break };
                        trace!(kind = ?ev.kind, "dispatching event");
                        let subs = inner.subs.read();
                        for sub in subs.values() {
                            if sub.tx.try_send(ev.clone()).is_err() {
                                sub.dropped.fetch_add(1, Ordering::Relaxed);
                                metrics::BUS_DROPPED_EVENTS.inc();
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            // closing the senders wakes every subscriber with `None`
            inner.subs.write().clear();
            debug!("event bus dispatcher stopped");
        });
    }

    /// Stop the dispatcher and close all subscriber channels.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Non-blocking publish. If the publish buffer is full the event is
    /// counted as dropped, the caller is never blocked.
    pub fn publish(&self, event: Event) {
        metrics::BUS_PUBLISHED_EVENTS.inc();
        if self.inner.tx.try_send(event).is_err() {
            self.inner.publish_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::BUS_DROPPED_EVENTS.inc();
        }
    }

    /// Register a subscriber with the default channel depth.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Register a subscriber with an explicit channel depth.
    pub fn subscribe_with(&self, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().insert(
            id,
            SubscriberHandle {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        Subscription {
            id,
            rx,
            dropped,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber by id. The matching `Subscription` will see a
    /// closed channel on its next `recv`.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.subs.write().remove(&id);
    }

    /// Events lost on the publish side since startup.
    pub fn publish_dropped(&self) -> u64 {
        self.inner.publish_dropped.load(Ordering::Relaxed)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseState, RelayInfo};
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn lease(ip: [u8; 4]) -> Lease {
        Lease {
            ip: Ipv4Addr::from(ip),
            mac: "00:11:22:33:44:55".parse().unwrap(),
            client_id: None,
            hostname: None,
            fqdn: None,
            subnet: "192.168.1.0/24".parse().unwrap(),
            pool: None,
            state: LeaseState::Active,
            starts_at: Utc::now(),
            expires_at: Utc::now(),
            updated_at: Utc::now(),
            update_seq: 1,
            options: BTreeMap::new(),
            relay: RelayInfo::default(),
        }
    }

    #[tokio::test]
    async fn publish_order_per_subscriber() {
        let bus = Bus::new();
        bus.start();
        let mut sub = bus.subscribe();
        for i in 0..10u8 {
            bus.publish(Event::lease(
                EventKind::LeaseAck,
                lease([10, 0, 0, i]),
                EventOrigin::Local,
            ));
        }
        for i in 0..10u8 {
            let ev = sub.recv().await.unwrap();
            assert_eq!(ev.lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, i));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking() {
        let bus = Bus::new();
        bus.start();
        let sub = bus.subscribe_with(2);
        for i in 0..50u8 {
            bus.publish(Event::lease(
                EventKind::LeaseAck,
                lease([10, 0, 0, i]),
                EventOrigin::Local,
            ));
        }
        // give the dispatcher a chance to run down the queue
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sub.dropped() > 0);
    }

    #[tokio::test]
    async fn stop_closes_subscribers() {
        let bus = Bus::new();
        bus.start();
        let mut sub = bus.subscribe();
        bus.stop();
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::LeaseAck).unwrap();
        assert_eq!(json, "\"lease.ack\"");
        let json = serde_json::to_string(&EventKind::HaStateChange).unwrap();
        assert_eq!(json, "\"ha.state_change\"");
    }
}
