//! The HA controller: heartbeat, peer link lifecycle, replication and
//! the role/state machine.
//!
//! Connection direction is fixed by configured role: the primary
//! listens, the secondary dials with exponential backoff. Heartbeats
//! flow both ways over the single link. The standby requests a full
//! snapshot on every (re)connect, then tails lease and config updates.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dynconfig::{ConfigStore, HaIdentity, NodeRole, Section};
use haven_core::prelude::*;
use lease_engine::LeaseEngine;

use crate::link::{PeerFrame, PeerIo, PeerLink};
use crate::{tls, HaHandle, HaState};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const SNAPSHOT_CHUNK: usize = 128;

struct Ctx {
    engine: Arc<LeaseEngine>,
    cfg: ConfigStore,
    bus: Bus,
    handle: HaHandle,
    identity: HaIdentity,
    heartbeat: Duration,
    failover: Duration,
    node: String,
    /// write-serialising queue onto the current link, `None` when down
    outbound: watch::Sender<Option<mpsc::UnboundedSender<PeerFrame>>>,
    last_heartbeat: Mutex<Option<Instant>>,
    started: Instant,
    peer_last_seq: AtomicU64,
    applied_seq: AtomicU64,
    peer_state: Mutex<Option<HaState>>,
    peer_epoch: AtomicU64,
    cancel: CancellationToken,
}

/// The controller. `start` spawns its tasks; the handle stays valid for
/// the process lifetime.
#[derive(Clone)]
pub struct HaController {
    ctx: Arc<Ctx>,
}

impl std::fmt::Debug for HaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaController")
            .field("state", &self.ctx.handle.state())
            .finish()
    }
}

impl HaController {
    pub fn new(
        engine: Arc<LeaseEngine>,
        cfg: ConfigStore,
        bus: Bus,
        handle: HaHandle,
        identity: HaIdentity,
        heartbeat: Duration,
        failover: Duration,
        node: String,
        cancel: CancellationToken,
    ) -> Self {
        let (outbound, _) = watch::channel(None);
        Self {
            ctx: Arc::new(Ctx {
                engine,
                cfg,
                bus,
                handle,
                identity,
                heartbeat,
                failover,
                node,
                outbound,
                last_heartbeat: Mutex::new(None),
                started: Instant::now(),
                peer_last_seq: AtomicU64::new(0),
                applied_seq: AtomicU64::new(0),
                peer_state: Mutex::new(None),
                peer_epoch: AtomicU64::new(0),
                cancel,
            }),
        }
    }

    pub fn handle(&self) -> HaHandle {
        self.ctx.handle.clone()
    }

    /// Spawn the heartbeat, replication and link tasks.
    pub fn start(&self) {
        // local config mutations stream to the peer as they happen
        let ctx = Arc::clone(&self.ctx);
        self.ctx.cfg.on_local_change(move |section, json| {
            ctx.send_frame(PeerFrame::ConfigSection {
                section,
                data: json.to_string(),
            });
        });

        // lease mutations fan out from the bus
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut sub = ctx.bus.subscribe_with(4_096);
            loop {
                tokio::select! {
                    ev = sub.recv() => {
                        let Some(ev) = ev else { break };
                        if let Some(frame) = event_to_frame(&ev) {
                            ctx.send_frame(frame);
                        }
                    }
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        });

        // heartbeat tx + failover watchdog
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ctx.send_frame(PeerFrame::Heartbeat {
                            state: ctx.handle.state(),
                            epoch: ctx.handle.epoch(),
                            last_seq: ctx.engine.store().last_seq(),
                        });
                        ctx.check_failover();
                    }
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        });

        // the link itself: primary listens, secondary dials
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let result = match ctx.identity.role {
                NodeRole::Primary => ctx.run_listener().await,
                NodeRole::Secondary => ctx.run_dialer().await,
            };
            if let Err(err) = result {
                error!(%err, "peer link task ended");
                ctx.handle.set_peer_connected(false, Some(err.to_string()));
            }
        });
    }

    /// Operator-initiated takeover (any state -> active).
    pub fn claim_active(&self, reason: &str) {
        self.ctx.claim_active(reason);
    }

    /// Operator-initiated yield.
    pub fn yield_active(&self, reason: &str) {
        self.ctx.yield_active(reason);
    }

    /// A local failure that must stop this node from serving.
    pub fn external_fault(&self, err: &str) {
        self.ctx.handle.set_state(HaState::Fault, err);
    }

    /// Leave `fault` and resume heartbeating as standby.
    pub fn recover(&self) {
        if self.ctx.handle.state() == HaState::Fault {
            self.ctx.handle.set_state(HaState::Standby, "recovered");
        }
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> &Arc<Ctx> {
        &self.ctx
    }
}

impl Ctx {
    fn send_frame(&self, frame: PeerFrame) {
        let sent = {
            let guard = self.outbound.borrow();
            match guard.as_ref() {
                Some(tx) => tx.send(frame).is_ok(),
                None => false,
            }
        };
        if !sent {
            debug!("peer link down, frame dropped (snapshot will reconcile)");
        }
    }

    fn claim_active(&self, reason: &str) {
        // the claim epoch outruns everything either side has seen
        let epoch = self
            .engine
            .store()
            .last_seq()
            .max(self.peer_last_seq.load(Ordering::SeqCst) + 1);
        self.handle.set_epoch(epoch);
        self.handle.set_state(HaState::Active, reason);
        for vip in self.cfg.config().vips.vips {
            info!(address = %vip.address, interface = %vip.interface, "claiming vip");
        }
    }

    fn yield_active(&self, reason: &str) {
        self.handle.set_state(HaState::Standby, reason);
        for vip in self.cfg.config().vips.vips {
            info!(address = %vip.address, interface = %vip.interface, "releasing vip");
        }
    }

    /// Arm the failover: with no heartbeat for `failover`, a standby (or
    /// still-initialising) node claims active.
    fn check_failover(&self) {
        let since = {
            let last = self.last_heartbeat.lock();
            last.map(|t| t.elapsed())
                .unwrap_or_else(|| self.started.elapsed())
        };
        if since < self.failover {
            return;
        }
        match self.handle.state() {
            HaState::Init => self.claim_active("no peer heartbeat at startup"),
            HaState::Standby => self.claim_active("peer heartbeat timeout"),
            HaState::Active | HaState::Fault => {}
        }
    }

    async fn run_listener(self: &Arc<Self>) -> Result<()> {
        let addr = self
            .identity
            .listen_address
            .ok_or_else(|| Error::validation("ha enabled on primary without listen_address"))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::PeerUnavailable(format!("binding {addr}: {e}")))?;
        info!(%addr, "listening for ha peer");
        let acceptor = match &self.identity.tls {
            Some(identity) => Some(tls::acceptor(identity)?),
            None => None,
        };
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(?err, "accept failed");
                            continue;
                        }
                    };
                    info!(%peer, "ha peer connected");
                    let io: Box<dyn PeerIo> = match &acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => Box::new(tls),
                            Err(err) => {
                                warn!(?err, "tls accept failed");
                                continue;
                            }
                        },
                        None => Box::new(stream),
                    };
                    if let Err(err) = self.session(io).await {
                        warn!(%err, "peer session ended");
                    }
                    self.on_disconnect(None);
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn run_dialer(self: &Arc<Self>) -> Result<()> {
        let peer = self
            .identity
            .peer_address
            .clone()
            .ok_or_else(|| Error::validation("ha enabled on secondary without peer_address"))?;
        let connector = match &self.identity.tls {
            Some(identity) => Some((
                tls::connector(identity)?,
                tls::server_name(identity, peer.split(':').next().unwrap_or(&peer))?,
            )),
            None => None,
        };
        let mut backoff = RECONNECT_MIN;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            metrics::HA_RECONNECTS.inc();
            match TcpStream::connect(&peer).await {
                Ok(stream) => {
                    info!(%peer, "connected to ha peer");
                    let io: std::result::Result<Box<dyn PeerIo>, std::io::Error> = match &connector
                    {
                        Some((connector, name)) => connector
                            .connect(name.clone(), stream)
                            .await
                            .map(|tls| Box::new(tls) as Box<dyn PeerIo>),
                        None => Ok(Box::new(stream)),
                    };
                    match io {
                        Ok(io) => {
                            backoff = RECONNECT_MIN;
                            if let Err(err) = self.session(io).await {
                                warn!(%err, "peer session ended");
                                self.on_disconnect(Some(err.to_string()));
                            } else {
                                self.on_disconnect(None);
                            }
                        }
                        Err(err) => {
                            warn!(?err, "tls connect failed");
                            self.on_disconnect(Some(err.to_string()));
                        }
                    }
                }
                Err(err) => {
                    debug!(%peer, ?err, "peer connect failed");
                    self.on_disconnect(Some(err.to_string()));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    fn on_disconnect(&self, error: Option<String>) {
        self.outbound.send_replace(None);
        self.handle.set_peer_connected(false, error);
        *self.peer_state.lock() = None;
    }

    /// One connected session: hello exchange, snapshot, then tailing.
    async fn session(self: &Arc<Self>, io: Box<dyn PeerIo>) -> Result<()> {
        let mut link = PeerLink::new(io);
        link.send(&PeerFrame::Hello {
            node: self.node.clone(),
            role: self.identity.role,
            token: self.identity.auth_token.clone(),
            last_seq: self.engine.store().last_seq(),
            epoch: self.handle.epoch(),
        })
        .await?;

        let hello = link
            .recv()
            .await?
            .ok_or_else(|| Error::PeerUnavailable("closed before hello".into()))?;
        let PeerFrame::Hello {
            node,
            role,
            token,
            last_seq,
            epoch,
        } = hello
        else {
            return Err(Error::PeerUnavailable("first frame was not hello".into()));
        };
        if self.identity.auth_token.is_some() && token != self.identity.auth_token {
            return Err(Error::Auth(format!("peer {node} presented a bad token")));
        }
        if role == self.identity.role {
            warn!(%node, ?role, "peer claims the same role as us");
        }
        self.peer_last_seq.store(last_seq, Ordering::SeqCst);
        self.peer_epoch.store(epoch, Ordering::SeqCst);
        self.handle.set_peer_connected(true, None);
        *self.last_heartbeat.lock() = Some(Instant::now());

        // initial intent: the primary claims, everyone else stands by
        match self.handle.state() {
            HaState::Init => {
                if self.identity.role == NodeRole::Primary {
                    self.claim_active("initial claim as primary");
                } else {
                    self.handle.set_state(HaState::Standby, "peer connected");
                }
            }
            _ => {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.outbound.send_replace(Some(tx));

        // the standby catches up from a full snapshot before tailing
        if !self.handle.is_active() {
            link.send(&PeerFrame::SnapshotRequest {
                last_seq: self.applied_seq.load(Ordering::SeqCst),
            })
            .await?;
        }

        let (mut sink, mut source) = link.split();
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(frame) => sink.send(&frame).await?,
                        None => return Ok(()),
                    }
                }
                incoming = source.recv() => {
                    match incoming? {
                        Some(frame) => self.handle_frame(frame).await?,
                        None => {
                            info!("peer closed the link");
                            return Ok(());
                        }
                    }
                }
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: PeerFrame) -> Result<()> {
        match frame {
            PeerFrame::Hello { .. } => {
                debug!("duplicate hello ignored");
            }
            PeerFrame::Heartbeat {
                state,
                epoch,
                last_seq,
            } => {
                *self.last_heartbeat.lock() = Some(Instant::now());
                self.handle.touch_heartbeat();
                self.peer_last_seq.store(last_seq, Ordering::SeqCst);
                self.peer_epoch.store(epoch, Ordering::SeqCst);
                *self.peer_state.lock() = Some(state);
                self.resolve_split_brain(state, epoch);
            }
            PeerFrame::LeaseUpdate { seq, lease } => {
                if seq <= self.applied_seq.load(Ordering::SeqCst) {
                    debug!(seq, "stale lease update ignored");
                    return Ok(());
                }
                self.engine.apply_peer_lease(lease).await?;
                self.applied_seq.fetch_max(seq, Ordering::SeqCst);
            }
            PeerFrame::LeaseDelete { seq, ip } => {
                if seq <= self.applied_seq.load(Ordering::SeqCst) {
                    debug!(seq, "stale lease delete ignored");
                    return Ok(());
                }
                self.engine.apply_peer_delete(ip, seq).await?;
                self.applied_seq.fetch_max(seq, Ordering::SeqCst);
            }
            PeerFrame::ConfigSection { section, data } => {
                if let Err(err) = self.cfg.apply_peer_section(section, &data) {
                    warn!(%section, %err, "replicated config section rejected");
                }
            }
            PeerFrame::SnapshotRequest { last_seq } => {
                info!(peer_applied = last_seq, "streaming snapshot to peer");
                for frame in self.snapshot_frames()? {
                    self.send_frame(frame);
                }
            }
            PeerFrame::SnapshotChunk { leases } => {
                for lease in leases {
                    let seq = lease.update_seq;
                    self.engine.apply_peer_lease(lease).await?;
                    self.applied_seq.fetch_max(seq, Ordering::SeqCst);
                }
            }
            PeerFrame::SnapshotEnd { last_seq } => {
                self.applied_seq.fetch_max(last_seq, Ordering::SeqCst);
                info!(last_seq, leases = self.engine.store().lease_count(), "snapshot applied");
            }
        }
        Ok(())
    }

    /// Both sides active: the lower claim epoch yields; on a tie the
    /// configured primary wins.
    fn resolve_split_brain(&self, peer_state: HaState, peer_epoch: u64) {
        if self.handle.state() != HaState::Active || peer_state != HaState::Active {
            return;
        }
        let ours = self.handle.epoch();
        if ours < peer_epoch {
            warn!(ours, peer_epoch, "split brain: yielding to higher epoch");
            self.yield_active("split brain, peer epoch higher");
        } else if ours == peer_epoch && self.identity.role == NodeRole::Secondary {
            warn!(ours, "split brain at equal epoch: primary wins");
            self.yield_active("split brain, epoch tie");
        }
    }

    /// The full state transfer: every lease in sequence order, then
    /// every config section, then the cutoff marker.
    fn snapshot_frames(&self) -> Result<Vec<PeerFrame>> {
        let mut leases = self.engine.all_leases();
        leases.sort_by_key(|l| l.update_seq);
        let mut frames = Vec::with_capacity(leases.len() / SNAPSHOT_CHUNK + 14);
        for chunk in leases.chunks(SNAPSHOT_CHUNK) {
            frames.push(PeerFrame::SnapshotChunk {
                leases: chunk.to_vec(),
            });
        }
        for (section, data) in self.cfg.snapshot_sections()? {
            frames.push(PeerFrame::ConfigSection { section, data });
        }
        frames.push(PeerFrame::SnapshotEnd {
            last_seq: self.engine.store().last_seq(),
        });
        Ok(frames)
    }
}

/// Map a bus event to its replication frame. Peer-originated events are
/// never echoed back; server events don't replicate.
fn event_to_frame(ev: &Event) -> Option<PeerFrame> {
    if ev.origin == EventOrigin::Peer {
        return None;
    }
    let lease = ev.lease.as_ref()?;
    if ev.kind.is_lease_upsert() {
        Some(PeerFrame::LeaseUpdate {
            seq: lease.update_seq,
            lease: lease.clone(),
        })
    } else if ev.kind.is_lease_removal() {
        Some(PeerFrame::LeaseDelete {
            seq: lease.update_seq,
            ip: lease.ip,
        })
    } else {
        None
    }
}
