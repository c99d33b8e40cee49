//! The lease engine proper.
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conflict_detect::{ConflictMethod, ConflictTable, ProbeEngine};
use dynconfig::{ConfigStore, Pool, Reservation, Subnet};
use haven_core::prelude::*;
use hostname_filter::HostnameFilter;
use store::Store;

/// How long an offer is held before the expiry sweep reclaims it.
pub const OFFER_HOLD: Duration = Duration::from_secs(60);

/// Identity and attributes of the requesting client, as extracted from
/// the wire message.
#[derive(Debug, Clone)]
pub struct ClientView {
    pub mac: MacAddr,
    pub client_id: Option<Vec<u8>>,
    pub hostname: Option<String>,
    pub requested_ip: Option<Ipv4Addr>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
    pub relay: RelayInfo,
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            mac: MacAddr::zero(),
            client_id: None,
            hostname: None,
            requested_ip: None,
            vendor_class: None,
            user_class: None,
            relay: RelayInfo::default(),
        }
    }
}

impl ClientView {
    fn client_id_slice(&self) -> Option<&[u8]> {
        self.client_id.as_deref()
    }
}

/// The lease engine. One per process; mutations are serialised by an
/// engine-wide write lock, lookups go through cloned index snapshots.
pub struct LeaseEngine {
    store: Store,
    table: Arc<ConflictTable>,
    probe: Arc<ProbeEngine>,
    cfg: ConfigStore,
    bus: Bus,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for LeaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseEngine")
            .field("leases", &self.store.lease_count())
            .finish()
    }
}

impl LeaseEngine {
    pub fn new(
        store: Store,
        table: Arc<ConflictTable>,
        probe: Arc<ProbeEngine>,
        cfg: ConfigStore,
        bus: Bus,
    ) -> Self {
        Self {
            store,
            table,
            probe,
            cfg,
            bus,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn conflicts(&self) -> &ConflictTable {
        &self.table
    }

    /// The client's current lease: client-id match first, MAC fallback.
    pub fn find_existing(&self, client_id: Option<&[u8]>, mac: MacAddr) -> Option<Lease> {
        if let Some(id) = client_id {
            if let Some(lease) = self.store.get_by_client_id(id) {
                return Some(lease);
            }
        }
        self.store.get_by_mac(mac)
    }

    /// The reservation covering this client in `subnet`, if any.
    pub fn find_reservation(
        &self,
        client_id: Option<&[u8]>,
        mac: MacAddr,
        subnet: &Subnet,
    ) -> Option<Reservation> {
        subnet
            .reservations
            .iter()
            .find(|r| r.matches(client_id, mac))
            .cloned()
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.store.get_by_ip(ip)
    }

    pub fn all_leases(&self) -> Vec<Lease> {
        self.store.all_leases()
    }

    /// Effective lease duration for an allocation, in seconds:
    /// reservation override, then pool, then subnet, then the global
    /// default.
    pub fn lease_secs(
        &self,
        subnet: &Subnet,
        pool: Option<&Pool>,
        reservation: Option<&Reservation>,
    ) -> u64 {
        reservation
            .and_then(|r| r.lease_time_secs)
            .or_else(|| pool.and_then(|p| p.lease_time_secs))
            .or(subnet.lease_time_secs)
            .unwrap_or_else(|| self.cfg.defaults().lease_time_secs)
    }

    /// The FQDN a hostname registers under, per the DDNS domain.
    fn fqdn_for(&self, hostname: &str) -> Option<String> {
        let domain = self.cfg.ddns().domain;
        if domain.is_empty() {
            None
        } else {
            Some(format!("{hostname}.{domain}"))
        }
    }

    fn sanitized_hostname(
        &self,
        subnet: &Subnet,
        client: &ClientView,
        reservation: Option<&Reservation>,
    ) -> String {
        // a reservation hostname wins over whatever the client claims
        if let Some(name) = reservation.and_then(|r| r.hostname.clone()) {
            return name;
        }
        let filter = HostnameFilter::new(self.cfg.sanitizer_for(Some(&subnet.cidr)));
        let store = self.store.clone();
        let own_ip = self
            .find_existing(client.client_id_slice(), client.mac)
            .map(|l| l.ip);
        filter.resolve(client.hostname.as_deref(), client.mac, move |name| {
            store
                .get_by_hostname(name)
                .filter(|l| Some(l.ip) != own_ip)
                .map(|l| l.mac)
        })
    }

    /// Create an offer for this client in the subnet selected by
    /// `subnet_hint` (giaddr, or the receiving interface's network).
    /// Publishes `lease.offer`.
    #[instrument(level = "debug", skip(self, client), fields(mac = %client.mac))]
    pub async fn create_offer(&self, client: &ClientView, subnet_hint: Ipv4Addr) -> Result<Lease> {
        let _guard = self.write_lock.lock().await;
        let subnet = self
            .cfg
            .subnet_for(subnet_hint)
            .ok_or_else(|| Error::NotFound(format!("no subnet configured for {subnet_hint}")))?;

        let reservation = self.find_reservation(client.client_id_slice(), client.mac, &subnet);
        let (ip, pool_name) = self.allocate(client, &subnet, reservation.as_ref()).await?;

        let now = Utc::now();
        let hostname = self.sanitized_hostname(&subnet, client, reservation.as_ref());

        // a previous lease for this client on a different address is
        // superseded by the new offer; its removal must replicate before
        // the offer, so it draws its sequence first
        if let Some(prior) = self.find_existing(client.client_id_slice(), client.mac) {
            if prior.ip != ip {
                if let Some(mut old) = self.store.delete_lease(prior.ip)? {
                    old.state = LeaseState::Expired;
                    old.updated_at = now;
                    old.update_seq = self.store.next_seq();
                    self.bus.publish(
                        Event::lease(EventKind::LeaseExpire, old, EventOrigin::Local)
                            .with_reason("superseded by new offer"),
                    );
                }
            }
        }

        let lease = Lease {
            ip,
            mac: client.mac,
            client_id: client.client_id.clone(),
            fqdn: self.fqdn_for(&hostname),
            hostname: Some(hostname),
            subnet: subnet.cidr,
            pool: pool_name,
            state: LeaseState::Offered,
            starts_at: now,
            expires_at: now + ChronoDuration::seconds(OFFER_HOLD.as_secs() as i64),
            updated_at: now,
            update_seq: self.store.next_seq(),
            options: BTreeMap::new(),
            relay: client.relay.clone(),
        };
        self.store.put_lease(&lease)?;
        metrics::LEASE_EVENTS.with_label_values(&["offer"]).inc();
        self.bus.publish(Event::lease(
            EventKind::LeaseOffer,
            lease.clone(),
            EventOrigin::Local,
        ));
        info!(%ip, mac = %client.mac, "offered address");
        Ok(lease)
    }

    /// Confirm (DHCPREQUEST) the lease on `ip` for this client. A fresh
    /// bind publishes `lease.ack`; extending an already-active lease for
    /// the same MAC publishes `lease.renew`. Returns the stored lease
    /// and whether this was a renewal.
    #[instrument(level = "debug", skip(self, client), fields(mac = %client.mac, %ip))]
    pub async fn confirm_lease(&self, client: &ClientView, ip: Ipv4Addr) -> Result<(Lease, bool)> {
        let _guard = self.write_lock.lock().await;
        let subnet = self
            .cfg
            .subnet_for(ip)
            .ok_or_else(|| Error::NotFound(format!("no subnet configured for {ip}")))?;
        let reservation = self.find_reservation(client.client_id_slice(), client.mac, &subnet);
        let now = Utc::now();

        let existing = self.store.get_by_ip(ip);
        let (is_renewal, starts_at) = match &existing {
            Some(current) if current.mac == client.mac => {
                (current.state == LeaseState::Active, current.starts_at)
            }
            Some(current) if current.expired_at(now) => {
                debug!(prior_mac = %current.mac, "taking over expired lease");
                (false, now)
            }
            Some(current) => {
                debug!(holder = %current.mac, "address held by another client");
                return Err(Error::ConflictDetected(ip));
            }
            None => {
                // no offer on file: only an authoritative server binds
                // a bare REQUEST
                if !self.cfg.defaults().authoritative {
                    return Err(Error::NotFound(format!("no lease on file for {ip}")));
                }
                if self.table.is_conflicted(ip) {
                    return Err(Error::ConflictDetected(ip));
                }
                (false, now)
            }
        };

        let pool = subnet.pools.iter().find(|p| p.contains(ip));
        if pool.is_none() && reservation.as_ref().map(|r| r.ip) != Some(ip) {
            return Err(Error::Validation(format!(
                "{ip} is neither pooled nor reserved in {}",
                subnet.cidr
            )));
        }
        let secs = self.lease_secs(&subnet, pool, reservation.as_ref());
        let hostname = self.sanitized_hostname(&subnet, client, reservation.as_ref());

        let lease = Lease {
            ip,
            mac: client.mac,
            client_id: client.client_id.clone(),
            fqdn: self.fqdn_for(&hostname),
            hostname: Some(hostname),
            subnet: subnet.cidr,
            pool: pool.map(|p| p.name.clone()),
            state: LeaseState::Active,
            starts_at,
            expires_at: now + ChronoDuration::seconds(secs as i64),
            updated_at: now,
            update_seq: self.store.next_seq(),
            options: BTreeMap::new(),
            relay: client.relay.clone(),
        };
        self.store.put_lease(&lease)?;

        let kind = if is_renewal {
            EventKind::LeaseRenew
        } else {
            EventKind::LeaseAck
        };
        metrics::LEASE_EVENTS
            .with_label_values(&[if is_renewal { "renew" } else { "ack" }])
            .inc();
        self.bus
            .publish(Event::lease(kind, lease.clone(), EventOrigin::Local));
        info!(%ip, mac = %client.mac, renewal = is_renewal, "lease confirmed");
        Ok((lease, is_renewal))
    }

    /// Release the lease on `ip`. Matched by IP; a MAC mismatch is
    /// logged but honoured. Publishes `lease.release`.
    #[instrument(level = "debug", skip(self))]
    pub async fn release(&self, ip: Ipv4Addr, mac: MacAddr) -> Result<Option<Lease>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut lease) = self.store.delete_lease(ip)? else {
            return Ok(None);
        };
        if lease.mac != mac {
            warn!(%ip, held_by = %lease.mac, released_by = %mac, "release mac mismatch, honouring");
        }
        lease.state = LeaseState::Released;
        lease.updated_at = Utc::now();
        lease.update_seq = self.store.next_seq();
        metrics::LEASE_EVENTS.with_label_values(&["release"]).inc();
        self.bus.publish(Event::lease(
            EventKind::LeaseRelease,
            lease.clone(),
            EventOrigin::Local,
        ));
        info!(%ip, "lease released");
        Ok(Some(lease))
    }

    /// Handle a DHCPDECLINE: the client saw the address in use. The
    /// lease is deleted and the conflict table is charged. Publishes
    /// `lease.decline`.
    #[instrument(level = "debug", skip(self))]
    pub async fn decline(&self, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let removed = self.store.delete_lease(ip)?;
        let subnet = self.cfg.subnet_for(ip).map(|s| s.cidr);
        self.table
            .add(ip, ConflictMethod::ClientDecline, Some(mac), subnet)?;

        if let Some(mut lease) = removed {
            lease.state = LeaseState::Declined;
            lease.updated_at = Utc::now();
            lease.update_seq = self.store.next_seq();
            metrics::LEASE_EVENTS.with_label_values(&["decline"]).inc();
            self.bus.publish(Event::lease(
                EventKind::LeaseDecline,
                lease,
                EventOrigin::Local,
            ));
        }
        info!(%ip, %mac, "client declined address");
        Ok(())
    }

    /// Reap every offered or active lease past expiry. Publishes one
    /// `lease.expire` per reaped lease; returns the count.
    pub async fn expire_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let expired: Vec<Lease> = self
            .store
            .all_leases()
            .into_iter()
            .filter(|l| l.state.expirable() && l.expired_at(now))
            .collect();
        let count = expired.len();
        for mut lease in expired {
            self.store.delete_lease(lease.ip)?;
            lease.state = LeaseState::Expired;
            lease.updated_at = now;
            lease.update_seq = self.store.next_seq();
            metrics::LEASE_EVENTS.with_label_values(&["expire"]).inc();
            metrics::EXPIRED_LEASES.inc();
            self.bus.publish(Event::lease(
                EventKind::LeaseExpire,
                lease,
                EventOrigin::Local,
            ));
        }
        Ok(count)
    }

    /// Apply a lease replicated from the HA peer: written exactly as
    /// received (sequence, timestamps, state), bypassing allocation.
    /// The published event carries `Peer` origin so it is never echoed
    /// back.
    pub async fn apply_peer_lease(&self, lease: Lease) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.observe_seq(lease.update_seq);
        if let Some(current) = self.store.get_by_ip(lease.ip) {
            if current.update_seq == lease.update_seq && current != lease {
                warn!(ip = %lease.ip, seq = lease.update_seq, "peer lease diverges at equal sequence, keeping local copy");
                return Ok(());
            }
        }
        self.store.put_lease(&lease)?;
        let kind = match lease.state {
            LeaseState::Offered => EventKind::LeaseOffer,
            _ => EventKind::LeaseAck,
        };
        self.bus
            .publish(Event::lease(kind, lease, EventOrigin::Peer));
        Ok(())
    }

    /// Apply a peer-side lease deletion.
    pub async fn apply_peer_delete(&self, ip: Ipv4Addr, seq: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.observe_seq(seq);
        if let Some(mut lease) = self.store.delete_lease(ip)? {
            lease.state = LeaseState::Released;
            lease.update_seq = seq;
            self.bus.publish(Event::lease(
                EventKind::LeaseRelease,
                lease,
                EventOrigin::Peer,
            ));
        }
        Ok(())
    }

    /// Allocation policy: reservation, then the requested address, then
    /// the client's prior address, then the pool walk in declaration
    /// order, lowest address first. Conflicted and occupied addresses
    /// are skipped; eligible candidates are probed before assignment.
    async fn allocate(
        &self,
        client: &ClientView,
        subnet: &Subnet,
        reservation: Option<&Reservation>,
    ) -> Result<(Ipv4Addr, Option<String>)> {
        // 1. a reservation pre-empts pool allocation
        if let Some(res) = reservation {
            if self.candidate_free(res.ip, client) {
                if let Some(ip) = self
                    .probe
                    .first_available(&self.table, Some(subnet.cidr), std::iter::once(res.ip))
                    .await?
                {
                    return Ok((ip, None));
                }
            }
            debug!(ip = %res.ip, "reserved address unavailable, falling back to pools");
        }

        let eligible: Vec<&Pool> = subnet
            .pools
            .iter()
            .filter(|p| pool_matches(p, client))
            .collect();

        // 2. requested address, then prior address: re-offering reduces
        // churn in DNS and client caches
        let prior = self.find_existing(client.client_id_slice(), client.mac).map(|l| l.ip);
        for sticky in [client.requested_ip, prior].into_iter().flatten() {
            if let Some(pool) = eligible.iter().find(|p| p.contains(sticky)) {
                if self.candidate_free(sticky, client) {
                    if let Some(ip) = self
                        .probe
                        .first_available(&self.table, Some(subnet.cidr), std::iter::once(sticky))
                        .await?
                    {
                        return Ok((ip, Some(pool.name.clone())));
                    }
                }
            }
        }

        // 3. pool walk in declaration order
        for pool in eligible {
            let candidates: Vec<Ipv4Addr> = pool
                .iter()
                .filter(|&ip| self.candidate_free(ip, client))
                .collect();
            if let Some(ip) = self
                .probe
                .first_available(&self.table, Some(subnet.cidr), candidates.into_iter())
                .await?
            {
                return Ok((ip, Some(pool.name.clone())));
            }
        }
        Err(Error::NoAddressAvailable)
    }

    /// Free of foreign leases; the client's own lease does not block.
    fn candidate_free(&self, ip: Ipv4Addr, client: &ClientView) -> bool {
        match self.store.get_by_ip(ip) {
            None => true,
            Some(lease) => {
                lease.mac == client.mac || lease.expired_at(Utc::now())
            }
        }
    }
}

fn pool_matches(pool: &Pool, client: &ClientView) -> bool {
    fn matches(pattern: &Option<String>, value: Option<&[u8]>) -> bool {
        let Some(pattern) = pattern else { return true };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(err) => {
                warn!(%pattern, ?err, "invalid pool match regex, treating as no match");
                return false;
            }
        };
        match value {
            Some(v) => re.is_match(&String::from_utf8_lossy(v)),
            None => false,
        }
    }
    matches(
        &pool.circuit_id_regex,
        client.relay.circuit_id.as_deref(),
    ) && matches(&pool.remote_id_regex, client.relay.remote_id.as_deref())
        && matches(
            &pool.vendor_class_regex,
            client.vendor_class.as_deref().map(str::as_bytes),
        )
        && matches(
            &pool.user_class_regex,
            client.user_class.as_deref().map(str::as_bytes),
        )
}

/// The lease GC loop: expire leases and decay conflict records every
/// `interval` until cancelled.
pub async fn run_gc(engine: Arc<LeaseEngine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.expire_all().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "expired leases reaped"),
                    Err(err) => warn!(%err, "lease expiry sweep failed"),
                }
                match engine.conflicts().sweep() {
                    Ok(0) => {}
                    Ok(count) => info!(count, "conflict records decayed"),
                    Err(err) => warn!(%err, "conflict sweep failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use conflict_detect::{ProbeOutcome, ProbeVia, Prober, StaticProber};
    use dynconfig::{ConflictParams, Section};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    pub(crate) struct Fixture {
        pub engine: Arc<LeaseEngine>,
        pub prober: Arc<StaticProber>,
        pub cfg: ConfigStore,
        pub bus: Bus,
        _dir: TempDir,
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(ConflictParams::default())
    }

    pub(crate) fn fixture_with(params: ConflictParams) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db.redb"), &Section::buckets()).unwrap();
        let bus = Bus::new();
        let cfg = ConfigStore::load(store.clone()).unwrap();
        cfg.replace_section(Section::Subnets, &vec![test_subnet()]).unwrap();
        let table = Arc::new(
            ConflictTable::open(store.clone(), bus.clone(), params.clone(), "test".into()).unwrap(),
        );
        let prober = Arc::new(StaticProber::new());
        let probe = Arc::new(ProbeEngine::new(
            Arc::clone(&prober) as Arc<dyn Prober>,
            params,
        ));
        let engine = Arc::new(LeaseEngine::new(
            store,
            table,
            probe,
            cfg.clone(),
            bus.clone(),
        ));
        Fixture {
            engine,
            prober,
            cfg,
            bus,
            _dir: dir,
        }
    }

    pub(crate) fn test_subnet() -> Subnet {
        Subnet {
            cidr: "192.168.1.0/24".parse().unwrap(),
            pools: vec![Pool {
                name: "main".into(),
                start: Ipv4Addr::new(192, 168, 1, 100),
                end: Ipv4Addr::new(192, 168, 1, 200),
                lease_time_secs: None,
                circuit_id_regex: None,
                remote_id_regex: None,
                vendor_class_regex: None,
                user_class_regex: None,
            }],
            reservations: vec![Reservation {
                mac: Some("aa:bb:cc:dd:ee:ff".parse().unwrap()),
                client_id: None,
                ip: Ipv4Addr::new(192, 168, 1, 10),
                hostname: Some("switch-core".into()),
                lease_time_secs: None,
            }],
            lease_time_secs: None,
            options: BTreeMap::new(),
            sanitizer: None,
        }
    }

    pub(crate) fn client(mac: &str) -> ClientView {
        ClientView {
            mac: mac.parse().unwrap(),
            hostname: Some("laptop".into()),
            ..Default::default()
        }
    }

    fn bare_pool(name: &str, start: u8, end: u8) -> Pool {
        Pool {
            name: name.into(),
            start: Ipv4Addr::new(192, 168, 1, start),
            end: Ipv4Addr::new(192, 168, 1, end),
            lease_time_secs: None,
            circuit_id_regex: None,
            remote_id_regex: None,
            vendor_class_regex: None,
            user_class_regex: None,
        }
    }

    /// One subnet, three criteria-gated pools and an open one.
    pub(crate) fn gated_pools_subnet() -> Subnet {
        let mut subnet = test_subnet();
        subnet.reservations.clear();
        subnet.pools = vec![
            Pool {
                circuit_id_regex: Some("^eth1/".into()),
                ..bare_pool("switches", 50, 59)
            },
            Pool {
                user_class_regex: Some("^voip".into()),
                ..bare_pool("phones", 60, 69)
            },
            Pool {
                vendor_class_regex: Some("^docsis".into()),
                ..bare_pool("modems", 70, 79)
            },
            bare_pool("general", 100, 200),
        ];
        subnet
    }

    fn hint() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 0)
    }

    #[tokio::test]
    #[traced_test]
    async fn discover_offer_request_ack() {
        let fx = fixture();
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(offer.state, LeaseState::Offered);

        let (lease, renewal) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        assert!(!renewal);
        assert_eq!(lease.state, LeaseState::Active);
        // default lease time: 12 hours
        let secs = (lease.expires_at - lease.starts_at).num_seconds();
        assert_eq!(secs, 43_200);
    }

    #[tokio::test]
    #[traced_test]
    async fn renewal_emits_renew_and_preserves_start() {
        let fx = fixture();
        fx.bus.start();
        let mut sub = fx.bus.subscribe();
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        let (first, _) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        let (second, renewal) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        assert!(renewal);
        assert_eq!(first.starts_at, second.starts_at);
        assert!(second.update_seq > first.update_seq);

        let kinds: Vec<EventKind> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![EventKind::LeaseOffer, EventKind::LeaseAck, EventKind::LeaseRenew]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn reservation_overrides_pool() {
        let fx = fixture();
        let c = client("aa:bb:cc:dd:ee:ff");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(offer.hostname.as_deref(), Some("switch-core"));
    }

    #[tokio::test]
    #[traced_test]
    async fn conflicted_address_is_skipped() {
        let params = ConflictParams::default();
        let fx = fixture_with(params.clone());
        // seed .100 at the permanent threshold
        for _ in 0..params.max_conflict_count {
            fx.engine
                .conflicts()
                .add(
                    Ipv4Addr::new(192, 168, 1, 100),
                    ConflictMethod::ArpProbe,
                    None,
                    None,
                )
                .unwrap();
        }
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 101));
    }

    #[tokio::test]
    #[traced_test]
    async fn probe_hit_skips_address() {
        let fx = fixture();
        fx.prober.set(
            Ipv4Addr::new(192, 168, 1, 100),
            ProbeOutcome::InUse {
                mac: None,
                via: ProbeVia::Arp,
            },
        );
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 101));
        // the probe hit was recorded
        assert!(fx
            .engine
            .conflicts()
            .is_conflicted(Ipv4Addr::new(192, 168, 1, 100)));
    }

    #[tokio::test]
    #[traced_test]
    async fn decline_then_reoffer_next_address() {
        let fx = fixture();
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        let (lease, _) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(192, 168, 1, 100));

        fx.engine.decline(lease.ip, c.mac).await.unwrap();
        assert!(fx.engine.get_by_ip(lease.ip).is_none());
        assert_eq!(
            fx.engine.conflicts().get(lease.ip).unwrap().method,
            ConflictMethod::ClientDecline
        );

        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 101));
    }

    #[tokio::test]
    #[traced_test]
    async fn release_honours_mac_mismatch() {
        let fx = fixture();
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        let released = fx
            .engine
            .release(offer.ip, "de:ad:be:ef:00:00".parse().unwrap())
            .await
            .unwrap();
        assert!(released.is_some());
        assert!(fx.engine.get_by_ip(offer.ip).is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn client_keeps_prior_address() {
        let fx = fixture();
        let a = client("00:11:22:33:44:55");
        let b = client("00:11:22:33:44:56");
        let offer_a = fx.engine.create_offer(&a, hint()).await.unwrap();
        fx.engine.confirm_lease(&a, offer_a.ip).await.unwrap();
        fx.engine.create_offer(&b, hint()).await.unwrap();

        // client A discovers again: sticky to .100
        let again = fx.engine.create_offer(&a, hint()).await.unwrap();
        assert_eq!(again.ip, offer_a.ip);
    }

    #[tokio::test]
    #[traced_test]
    async fn uniqueness_across_indices() {
        let fx = fixture();
        let mut c = client("00:11:22:33:44:55");
        c.client_id = Some(vec![1, 2, 3]);
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        // same client id from a new mac: one lease remains
        let mut c2 = client("00:11:22:33:44:66");
        c2.client_id = Some(vec![1, 2, 3]);
        let offer2 = fx.engine.create_offer(&c2, hint()).await.unwrap();
        fx.engine.confirm_lease(&c2, offer2.ip).await.unwrap();

        let leases = fx.engine.all_leases();
        let with_id: Vec<_> = leases
            .iter()
            .filter(|l| l.client_id.as_deref() == Some(&[1, 2, 3]))
            .collect();
        assert_eq!(with_id.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn sequences_strictly_increase() {
        let fx = fixture();
        let mut last = 0;
        for i in 0..5u8 {
            let c = client(&format!("00:11:22:33:44:{i:02x}"));
            let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
            assert!(offer.update_seq > last);
            last = offer.update_seq;
            let (lease, _) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
            assert!(lease.update_seq > last);
            last = lease.update_seq;
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn expire_all_reaps_past_expiry() {
        let fx = fixture();
        let c = client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
        let (mut lease, _) = fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        // push the lease into the past through the peer-apply path
        lease.expires_at = Utc::now() - ChronoDuration::seconds(5);
        lease.update_seq += 1;
        fx.engine.apply_peer_lease(lease.clone()).await.unwrap();

        let count = fx.engine.expire_all().await.unwrap();
        assert_eq!(count, 1);
        assert!(fx.engine.get_by_ip(lease.ip).is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn pool_exhaustion_errors() {
        let fx = fixture();
        let mut subnet = test_subnet();
        subnet.pools[0].end = Ipv4Addr::new(192, 168, 1, 101);
        fx.cfg
            .replace_section(Section::Subnets, &vec![subnet])
            .unwrap();

        for mac in ["00:00:00:00:00:01", "00:00:00:00:00:02"] {
            let c = client(mac);
            let offer = fx.engine.create_offer(&c, hint()).await.unwrap();
            fx.engine.confirm_lease(&c, offer.ip).await.unwrap();
        }
        let c = client("00:00:00:00:00:03");
        let err = fx.engine.create_offer(&c, hint()).await.unwrap_err();
        assert!(matches!(err, Error::NoAddressAvailable));
    }

    #[tokio::test]
    #[traced_test]
    async fn pool_match_criteria_steer_allocation() {
        let fx = fixture();
        fx.cfg
            .replace_section(Section::Subnets, &vec![gated_pools_subnet()])
            .unwrap();

        // relayed through a matching port: the circuit-gated pool wins
        let mut relayed = client("00:11:22:33:44:55");
        relayed.relay.circuit_id = Some(b"eth1/7".to_vec());
        let offer = fx.engine.create_offer(&relayed, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(offer.pool.as_deref(), Some("switches"));

        // a voip user class (option 77) selects the phone pool
        let mut phone = client("00:11:22:33:44:56");
        phone.user_class = Some("voip-handset".into());
        let offer = fx.engine.create_offer(&phone, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 60));
        assert_eq!(offer.pool.as_deref(), Some("phones"));

        // a docsis vendor class (option 60) selects the modem pool
        let mut modem = client("00:11:22:33:44:57");
        modem.vendor_class = Some("docsis3.1".into());
        let offer = fx.engine.create_offer(&modem, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 70));
        assert_eq!(offer.pool.as_deref(), Some("modems"));

        // no attributes: every gated pool is skipped, not merely deprioritised
        let plain = client("00:11:22:33:44:58");
        let offer = fx.engine.create_offer(&plain, hint()).await.unwrap();
        assert_eq!(offer.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(offer.pool.as_deref(), Some("general"));

        // a non-matching attribute excludes too
        let mut wrong_port = client("00:11:22:33:44:59");
        wrong_port.relay.circuit_id = Some(b"eth2/1".to_vec());
        let offer = fx.engine.create_offer(&wrong_port, hint()).await.unwrap();
        assert_eq!(offer.pool.as_deref(), Some("general"));
    }

    #[tokio::test]
    #[traced_test]
    async fn hostnames_deduplicate() {
        let fx = fixture();
        let a = client("00:11:22:33:44:55");
        let b = client("00:11:22:33:44:56");
        let offer_a = fx.engine.create_offer(&a, hint()).await.unwrap();
        fx.engine.confirm_lease(&a, offer_a.ip).await.unwrap();
        let offer_b = fx.engine.create_offer(&b, hint()).await.unwrap();
        assert_eq!(offer_a.hostname.as_deref(), Some("laptop"));
        assert_eq!(offer_b.hostname.as_deref(), Some("laptop-2"));
    }

    #[tokio::test]
    #[traced_test]
    async fn peer_apply_preserves_sequence_and_origin() {
        let fx = fixture();
        fx.bus.start();
        let mut sub = fx.bus.subscribe();
        let lease = Lease {
            ip: Ipv4Addr::new(192, 168, 1, 150),
            mac: "00:11:22:33:44:55".parse().unwrap(),
            client_id: None,
            hostname: Some("replicated".into()),
            fqdn: None,
            subnet: "192.168.1.0/24".parse().unwrap(),
            pool: Some("main".into()),
            state: LeaseState::Active,
            starts_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::hours(12),
            updated_at: Utc::now(),
            update_seq: 500,
            options: BTreeMap::new(),
            relay: RelayInfo::default(),
        };
        fx.engine.apply_peer_lease(lease.clone()).await.unwrap();

        let stored = fx.engine.get_by_ip(lease.ip).unwrap();
        assert_eq!(stored.update_seq, 500);
        // local sequences continue above the observed peer sequence
        assert!(fx.engine.store().next_seq() > 500);

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.origin, EventOrigin::Peer);
        assert_eq!(ev.kind, EventKind::LeaseAck);
    }
}
