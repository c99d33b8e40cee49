//! The conflict table.
//!
//! Durable bookkeeping over the `conflicts` and `excluded_ips` buckets.
//! Records decay to a resolved-history ring after `conflict_hold_time`;
//! a record whose count reaches `max_conflict_count`, or that was added
//! with `admin_exclude`, is promoted to permanent and mirrored into
//! `excluded_ips`. Permanent records survive the hold-time expiry.
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use dynconfig::ConflictParams;
use haven_core::event::ServerInfo;
use haven_core::prelude::*;
use store::{Store, BUCKET_CONFLICTS, BUCKET_EXCLUDED_IPS};

/// How a conflict was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMethod {
    ArpProbe,
    IcmpProbe,
    ClientDecline,
    AdminExclude,
}

impl ConflictMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictMethod::ArpProbe => "arp_probe",
            ConflictMethod::IcmpProbe => "icmp_probe",
            ConflictMethod::ClientDecline => "client_decline",
            ConflictMethod::AdminExclude => "admin_exclude",
        }
    }
}

/// One observed conflict. Serialised as JSON in the `conflicts` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub ip: Ipv4Addr,
    pub method: ConflictMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ipv4Net>,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved: bool,
    pub permanent: bool,
}

impl ConflictRecord {
    fn expired(&self, hold: ChronoDuration, now: DateTime<Utc>) -> bool {
        !self.permanent && now > self.last_seen + hold
    }
}

/// Durable conflict bookkeeping, shared by the lease engine and the
/// admin surface.
pub struct ConflictTable {
    store: Store,
    bus: Bus,
    params: RwLock<ConflictParams>,
    active: RwLock<HashMap<Ipv4Addr, ConflictRecord>>,
    resolved: Mutex<VecDeque<ConflictRecord>>,
    permanent: RwLock<HashSet<Ipv4Addr>>,
    node: String,
}

impl std::fmt::Debug for ConflictTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictTable")
            .field("active", &self.active.read().len())
            .field("permanent", &self.permanent.read().len())
            .finish()
    }
}

impl ConflictTable {
    /// Rehydrate the table from the `conflicts` and `excluded_ips`
    /// buckets. Records already past their hold time land straight in
    /// the resolved ring.
    pub fn open(store: Store, bus: Bus, params: ConflictParams, node: String) -> Result<Self> {
        let hold = ChronoDuration::seconds(params.conflict_hold_time_secs as i64);
        let now = Utc::now();
        let mut active = HashMap::new();
        let mut resolved = VecDeque::new();
        let mut stale_keys = Vec::new();

        store.for_each(BUCKET_CONFLICTS, |key, value| {
            match serde_json::from_str::<ConflictRecord>(value) {
                Ok(mut rec) => {
                    if rec.expired(hold, now) {
                        rec.resolved = true;
                        stale_keys.push(key.to_string());
                        resolved.push_back(rec);
                    } else {
                        active.insert(rec.ip, rec);
                    }
                }
                Err(err) => warn!(key, ?err, "corrupt conflict record skipped"),
            }
        })?;
        for key in &stale_keys {
            store.delete(BUCKET_CONFLICTS, key)?;
        }
        while resolved.len() > params.resolved_history {
            resolved.pop_front();
        }

        let mut permanent = HashSet::new();
        store.for_each(BUCKET_EXCLUDED_IPS, |key, _value| {
            if let Ok(ip) = key.parse::<Ipv4Addr>() {
                permanent.insert(ip);
            }
        })?;

        info!(
            active = active.len(),
            resolved = resolved.len(),
            permanent = permanent.len(),
            "conflict table rehydrated"
        );
        metrics::PERMANENT_EXCLUSIONS.set(permanent.len() as i64);

        Ok(Self {
            store,
            bus,
            params: RwLock::new(params),
            active: RwLock::new(active),
            resolved: Mutex::new(resolved),
            permanent: RwLock::new(permanent),
            node,
        })
    }

    /// Apply refreshed detection parameters.
    pub fn set_params(&self, params: ConflictParams) {
        *self.params.write() = params;
    }

    fn hold(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.params.read().conflict_hold_time_secs as i64)
    }

    /// Record one observation for `ip`. Returns the updated record and
    /// whether this call tripped the address into conflicted state
    /// (first observation, or promotion to permanent).
    pub fn add(
        &self,
        ip: Ipv4Addr,
        method: ConflictMethod,
        mac: Option<MacAddr>,
        subnet: Option<Ipv4Net>,
    ) -> Result<(ConflictRecord, bool)> {
        let max_count = self.params.read().max_conflict_count;
        let now = Utc::now();

        let mut active = self.active.write();
        let was_conflicted = active.contains_key(&ip) || self.permanent.read().contains(&ip);
        let mut rec = active.get(&ip).cloned().unwrap_or(ConflictRecord {
            ip,
            method,
            mac,
            subnet,
            count: 0,
            first_seen: now,
            last_seen: now,
            resolved: false,
            permanent: false,
        });
        let was_permanent = rec.permanent;
        rec.count += 1;
        rec.last_seen = now;
        rec.method = method;
        if mac.is_some() {
            rec.mac = mac;
        }
        if subnet.is_some() {
            rec.subnet = subnet;
        }
        // admin_exclude is always permanent, regardless of count
        if method == ConflictMethod::AdminExclude || rec.count >= max_count {
            rec.permanent = true;
        }

        // disk first: a storage failure blocks the allocation and leaves
        // the in-memory table untouched
        let json = serde_json::to_string(&rec).map_err(Error::storage)?;
        self.store.put(BUCKET_CONFLICTS, &rec.ip.to_string(), &json)?;
        active.insert(ip, rec.clone());
        if rec.permanent && !was_permanent {
            self.store.put(
                BUCKET_EXCLUDED_IPS,
                &rec.ip.to_string(),
                &format!("{{\"method\":\"{}\"}}", rec.method.as_str()),
            )?;
            self.permanent.write().insert(ip);
            metrics::PERMANENT_EXCLUSIONS.set(self.permanent.read().len() as i64);
        }
        drop(active);

        let just_tripped = !was_conflicted || (rec.permanent && !was_permanent);
        metrics::CONFLICTS_DETECTED
            .with_label_values(&[method.as_str()])
            .inc();
        if just_tripped {
            self.bus.publish(
                Event::server(
                    EventKind::ConflictDetected,
                    ServerInfo {
                        node: self.node.clone(),
                        state: None,
                    },
                    format!("{} conflicted via {}", ip, method.as_str()),
                )
            );
        }
        debug!(%ip, method = method.as_str(), count = rec.count, permanent = rec.permanent, "conflict recorded");
        Ok((rec, just_tripped))
    }

    /// Current record for `ip`, if it is still active.
    pub fn get(&self, ip: Ipv4Addr) -> Option<ConflictRecord> {
        let hold = self.hold();
        let now = Utc::now();
        self.active
            .read()
            .get(&ip)
            .filter(|r| !r.expired(hold, now))
            .cloned()
    }

    /// The allocation gate: true while an unexpired record or a
    /// permanent exclusion covers `ip`.
    pub fn is_conflicted(&self, ip: Ipv4Addr) -> bool {
        if self.permanent.read().contains(&ip) {
            return true;
        }
        let hold = self.hold();
        let now = Utc::now();
        self.active
            .read()
            .get(&ip)
            .map(|r| !r.expired(hold, now))
            .unwrap_or(false)
    }

    /// Remove every trace of `ip`, including a permanent exclusion.
    pub fn clear(&self, ip: Ipv4Addr) -> Result<()> {
        let key = ip.to_string();
        self.store.delete(BUCKET_CONFLICTS, &key)?;
        self.store.delete(BUCKET_EXCLUDED_IPS, &key)?;
        self.active.write().remove(&ip);
        if self.permanent.write().remove(&ip) {
            metrics::PERMANENT_EXCLUSIONS.set(self.permanent.read().len() as i64);
        }
        self.publish_resolved(ip, "cleared");
        Ok(())
    }

    /// Move the record for `ip` to the resolved-history ring.
    pub fn resolve(&self, ip: Ipv4Addr) -> Result<()> {
        let Some(mut rec) = self.active.write().remove(&ip) else {
            return Err(Error::NotFound(format!("no conflict record for {ip}")));
        };
        let key = ip.to_string();
        self.store.delete(BUCKET_CONFLICTS, &key)?;
        if rec.permanent {
            self.store.delete(BUCKET_EXCLUDED_IPS, &key)?;
            self.permanent.write().remove(&ip);
            metrics::PERMANENT_EXCLUSIONS.set(self.permanent.read().len() as i64);
        }
        rec.resolved = true;
        self.push_resolved(rec);
        self.publish_resolved(ip, "resolved");
        Ok(())
    }

    /// Decay expired records to the resolved ring. Called from the GC
    /// loop; returns the number of records moved.
    pub fn sweep(&self) -> Result<usize> {
        let hold = self.hold();
        let now = Utc::now();
        let expired: Vec<ConflictRecord> = {
            let active = self.active.read();
            active
                .values()
                .filter(|r| r.expired(hold, now))
                .cloned()
                .collect()
        };
        let count = expired.len();
        for mut rec in expired {
            self.store.delete(BUCKET_CONFLICTS, &rec.ip.to_string())?;
            self.active.write().remove(&rec.ip);
            rec.resolved = true;
            let ip = rec.ip;
            self.push_resolved(rec);
            self.publish_resolved(ip, "hold time expired");
        }
        Ok(count)
    }

    fn push_resolved(&self, rec: ConflictRecord) {
        let cap = self.params.read().resolved_history;
        let mut ring = self.resolved.lock();
        ring.push_back(rec);
        while ring.len() > cap {
            ring.pop_front();
        }
    }

    fn publish_resolved(&self, ip: Ipv4Addr, reason: &str) {
        self.bus.publish(Event::server(
            EventKind::ConflictResolved,
            ServerInfo {
                node: self.node.clone(),
                state: None,
            },
            format!("{ip}: {reason}"),
        ));
    }

    pub fn all_active(&self) -> Vec<ConflictRecord> {
        let hold = self.hold();
        let now = Utc::now();
        self.active
            .read()
            .values()
            .filter(|r| !r.expired(hold, now))
            .cloned()
            .collect()
    }

    pub fn all_resolved(&self) -> Vec<ConflictRecord> {
        self.resolved.lock().iter().cloned().collect()
    }

    pub fn permanent_count(&self) -> usize {
        self.permanent.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn table(params: ConflictParams) -> (ConflictTable, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db.redb"), &[]).unwrap();
        let bus = Bus::new();
        (
            ConflictTable::open(store, bus, params, "test".into()).unwrap(),
            dir,
        )
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    #[test]
    #[traced_test]
    fn single_observation_gates_allocation() {
        let (table, _dir) = table(ConflictParams::default());
        assert!(!table.is_conflicted(ip(100)));
        let (rec, tripped) = table
            .add(ip(100), ConflictMethod::ClientDecline, None, None)
            .unwrap();
        assert!(tripped);
        assert_eq!(rec.count, 1);
        assert!(!rec.permanent);
        assert!(table.is_conflicted(ip(100)));
    }

    #[test]
    #[traced_test]
    fn count_promotion_to_permanent() {
        let params = ConflictParams {
            max_conflict_count: 3,
            ..Default::default()
        };
        let (table, _dir) = table(params);
        for i in 1..=3u32 {
            let (rec, _) = table
                .add(ip(50), ConflictMethod::ArpProbe, None, None)
                .unwrap();
            assert_eq!(rec.count, i);
        }
        let rec = table.get(ip(50)).unwrap();
        assert!(rec.permanent);
        assert_eq!(table.permanent_count(), 1);
        assert!(table.is_conflicted(ip(50)));
    }

    #[test]
    #[traced_test]
    fn admin_exclude_is_immediately_permanent() {
        let (table, _dir) = table(ConflictParams::default());
        let (rec, tripped) = table
            .add(ip(7), ConflictMethod::AdminExclude, None, None)
            .unwrap();
        assert!(tripped);
        assert!(rec.permanent);
        assert_eq!(rec.count, 1);
        assert!(table.is_conflicted(ip(7)));
    }

    #[test]
    #[traced_test]
    fn hold_time_decay_spares_permanent() {
        let params = ConflictParams {
            conflict_hold_time_secs: 0,
            ..Default::default()
        };
        let (table, _dir) = table(params);
        table
            .add(ip(10), ConflictMethod::ArpProbe, None, None)
            .unwrap();
        table
            .add(ip(11), ConflictMethod::AdminExclude, None, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1_100));

        assert!(!table.is_conflicted(ip(10)));
        assert!(table.is_conflicted(ip(11)));

        let moved = table.sweep().unwrap();
        assert_eq!(moved, 1);
        assert_eq!(table.all_resolved().len(), 1);
        assert!(table.all_resolved()[0].resolved);
    }

    #[test]
    #[traced_test]
    fn clear_removes_permanent_exclusion() {
        let (table, _dir) = table(ConflictParams::default());
        table
            .add(ip(20), ConflictMethod::AdminExclude, None, None)
            .unwrap();
        assert!(table.is_conflicted(ip(20)));
        table.clear(ip(20)).unwrap();
        assert!(!table.is_conflicted(ip(20)));
        assert_eq!(table.permanent_count(), 0);
    }

    #[test]
    #[traced_test]
    fn rehydrates_from_storage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.redb");
        {
            let store = Store::open(&path, &[]).unwrap();
            let table =
                ConflictTable::open(store, Bus::new(), ConflictParams::default(), "a".into())
                    .unwrap();
            table
                .add(ip(30), ConflictMethod::ClientDecline, None, None)
                .unwrap();
            table
                .add(ip(31), ConflictMethod::AdminExclude, None, None)
                .unwrap();
        }
        let store = Store::open(&path, &[]).unwrap();
        let table =
            ConflictTable::open(store, Bus::new(), ConflictParams::default(), "a".into()).unwrap();
        assert!(table.is_conflicted(ip(30)));
        assert!(table.is_conflicted(ip(31)));
        assert_eq!(table.permanent_count(), 1);
    }

    #[test]
    #[traced_test]
    fn resolved_ring_is_bounded() {
        let params = ConflictParams {
            resolved_history: 3,
            ..Default::default()
        };
        let (table, _dir) = table(params);
        for i in 0..10u8 {
            table
                .add(ip(i), ConflictMethod::ArpProbe, None, None)
                .unwrap();
            table.resolve(ip(i)).unwrap();
        }
        assert_eq!(table.all_resolved().len(), 3);
    }
}
