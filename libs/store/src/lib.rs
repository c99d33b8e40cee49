//! # store
//!
//! Embedded key-value database for the server. One redb file holds every
//! bucket: leases, the per-field lease indices, conflict bookkeeping,
//! dynamic config sections, users and metadata. Values are JSON strings,
//! keys are strings (client-ids are hex-encoded).
//!
//! Leases are special-cased: on open they are replayed into in-memory
//! secondary indices (by IP, MAC, client-id and hostname) and every
//! mutation updates disk and memory in lockstep inside a single write
//! transaction. After startup the process never reads leases from disk.
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, error, info};

use haven_core::prelude::*;

const LEASES: TableDefinition<&str, &str> = TableDefinition::new("leases");
const INDEX_MAC: TableDefinition<&str, &str> = TableDefinition::new("index_mac");
const INDEX_CLIENT_ID: TableDefinition<&str, &str> = TableDefinition::new("index_client_id");
const INDEX_HOSTNAME: TableDefinition<&str, &str> = TableDefinition::new("index_hostname");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

/// bucket names usable with the raw `put`/`get`/`delete`/`for_each` API
pub const BUCKET_CONFLICTS: &str = "conflicts";
pub const BUCKET_EXCLUDED_IPS: &str = "excluded_ips";
/// reserved for future durable event replay; the live bus has none
pub const BUCKET_EVENT_LOG: &str = "event_log";
pub const BUCKET_USERS: &str = "users";

const META_UPDATE_SEQ: &str = "update_seq";

static BASE_BUCKETS: &[&str] = &[
    BUCKET_CONFLICTS,
    BUCKET_EXCLUDED_IPS,
    BUCKET_EVENT_LOG,
    BUCKET_USERS,
];

#[derive(Default)]
struct LeaseIndex {
    by_ip: HashMap<Ipv4Addr, Lease>,
    by_mac: HashMap<MacAddr, Ipv4Addr>,
    // hex-encoded client id
    by_client_id: HashMap<String, Ipv4Addr>,
    by_hostname: HashMap<String, Ipv4Addr>,
}

impl LeaseIndex {
    fn remove(&mut self, lease: &Lease) {
        self.by_ip.remove(&lease.ip);
        if self.by_mac.get(&lease.mac) == Some(&lease.ip) {
            self.by_mac.remove(&lease.mac);
        }
        if let Some(id) = &lease.client_id {
            let key = hex::encode(id);
            if self.by_client_id.get(&key) == Some(&lease.ip) {
                self.by_client_id.remove(&key);
            }
        }
        if let Some(host) = &lease.hostname {
            let key = host.to_lowercase();
            if self.by_hostname.get(&key) == Some(&lease.ip) {
                self.by_hostname.remove(&key);
            }
        }
    }

    fn insert(&mut self, lease: Lease) {
        self.by_mac.insert(lease.mac, lease.ip);
        if let Some(id) = &lease.client_id {
            self.by_client_id.insert(hex::encode(id), lease.ip);
        }
        if let Some(host) = &lease.hostname {
            self.by_hostname.insert(host.to_lowercase(), lease.ip);
        }
        self.by_ip.insert(lease.ip, lease);
    }
}

/// Handle to the embedded database. Cheap to clone; a single file is
/// shared by every component.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    index: Arc<RwLock<LeaseIndex>>,
    seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("leases", &self.index.read().by_ip.len())
            .field("update_seq", &self.seq.load(Ordering::Relaxed))
            .finish()
    }
}

fn raw_def(name: &str) -> TableDefinition<'_, &'static str, &'static str> {
    TableDefinition::new(name)
}

impl Store {
    /// Open (or create) the database at `path`. Missing buckets are
    /// created; `extra_buckets` lets the config store register one bucket
    /// per dynamic section. All leases are replayed into memory; corrupt
    /// entries are skipped with a structural error log.
    pub fn open(path: impl AsRef<Path>, extra_buckets: &[&str]) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::storage)?;
        }
        let db = Database::create(path).map_err(Error::storage)?;

        // structural check: every bucket must exist before first use
        let txn = db.begin_write().map_err(Error::storage)?;
        {
            txn.open_table(LEASES).map_err(Error::storage)?;
            txn.open_table(INDEX_MAC).map_err(Error::storage)?;
            txn.open_table(INDEX_CLIENT_ID).map_err(Error::storage)?;
            txn.open_table(INDEX_HOSTNAME).map_err(Error::storage)?;
            txn.open_table(META).map_err(Error::storage)?;
            for name in BASE_BUCKETS.iter().copied().chain(extra_buckets.iter().copied()) {
                txn.open_table(raw_def(name)).map_err(Error::storage)?;
            }
        }
        txn.commit().map_err(Error::storage)?;

        let mut index = LeaseIndex::default();
        let mut high_seq = 0u64;
        {
            let read = db.begin_read().map_err(Error::storage)?;
            let leases = read.open_table(LEASES).map_err(Error::storage)?;
            for entry in leases.iter().map_err(Error::storage)? {
                let (key, value) = entry.map_err(Error::storage)?;
                match serde_json::from_str::<Lease>(value.value()) {
                    Ok(lease) => {
                        high_seq = high_seq.max(lease.update_seq);
                        index.insert(lease);
                    }
                    Err(err) => {
                        error!(key = key.value(), ?err, "corrupt lease entry skipped on load");
                    }
                }
            }
            let meta = read.open_table(META).map_err(Error::storage)?;
            if let Some(v) = meta.get(META_UPDATE_SEQ).map_err(Error::storage)? {
                if let Ok(seq) = v.value().parse::<u64>() {
                    high_seq = high_seq.max(seq);
                }
            }
        }
        info!(
            path = %path.display(),
            leases = index.by_ip.len(),
            update_seq = high_seq,
            "opened lease database"
        );
        metrics::ACTIVE_LEASES.set(index.by_ip.len() as i64);

        Ok(Self {
            db: Arc::new(db),
            index: Arc::new(RwLock::new(index)),
            seq: Arc::new(AtomicU64::new(high_seq)),
        })
    }

    /// Draw the next update sequence. Strictly increasing process-wide;
    /// persisted as a high-water mark with each lease write.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise the local sequence floor to at least `seq`. Used when
    /// applying peer-originated mutations so locally drawn sequences stay
    /// ahead of everything we have seen.
    pub fn observe_seq(&self, seq: u64) {
        self.seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// Last drawn (or observed) update sequence.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Persist a lease and refresh every index, disk first, memory after
    /// commit. A failed transaction leaves both untouched.
    pub fn put_lease(&self, lease: &Lease) -> Result<()> {
        let json = serde_json::to_string(lease).map_err(Error::storage)?;
        let key = lease.key();
        let mut index = self.index.write();
        let prev = index.by_ip.get(&lease.ip).cloned();

        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut leases = txn.open_table(LEASES).map_err(Error::storage)?;
            leases
                .insert(key.as_str(), json.as_str())
                .map_err(Error::storage)?;

            let mut mac_idx = txn.open_table(INDEX_MAC).map_err(Error::storage)?;
            let mut id_idx = txn.open_table(INDEX_CLIENT_ID).map_err(Error::storage)?;
            let mut host_idx = txn.open_table(INDEX_HOSTNAME).map_err(Error::storage)?;

            if let Some(prev) = &prev {
                if prev.mac != lease.mac {
                    mac_idx
                        .remove(prev.mac.to_string().as_str())
                        .map_err(Error::storage)?;
                }
                if prev.client_id != lease.client_id {
                    if let Some(id) = &prev.client_id {
                        id_idx
                            .remove(hex::encode(id).as_str())
                            .map_err(Error::storage)?;
                    }
                }
                if prev.hostname != lease.hostname {
                    if let Some(host) = &prev.hostname {
                        host_idx
                            .remove(host.to_lowercase().as_str())
                            .map_err(Error::storage)?;
                    }
                }
            }

            mac_idx
                .insert(lease.mac.to_string().as_str(), key.as_str())
                .map_err(Error::storage)?;
            if let Some(id) = &lease.client_id {
                id_idx
                    .insert(hex::encode(id).as_str(), key.as_str())
                    .map_err(Error::storage)?;
            }
            if let Some(host) = &lease.hostname {
                host_idx
                    .insert(host.to_lowercase().as_str(), key.as_str())
                    .map_err(Error::storage)?;
            }

            let mut meta = txn.open_table(META).map_err(Error::storage)?;
            let high = self.seq.load(Ordering::SeqCst).max(lease.update_seq);
            meta.insert(META_UPDATE_SEQ, high.to_string().as_str())
                .map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)?;

        if let Some(prev) = prev {
            index.remove(&prev);
        }
        index.insert(lease.clone());
        metrics::ACTIVE_LEASES.set(index.by_ip.len() as i64);
        debug!(ip = %lease.ip, seq = lease.update_seq, state = %lease.state, "lease persisted");
        Ok(())
    }

    /// Delete the lease for `ip` along with its index entries. Returns
    /// the removed lease, if one existed.
    pub fn delete_lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>> {
        let mut index = self.index.write();
        let Some(prev) = index.by_ip.get(&ip).cloned() else {
            return Ok(None);
        };
        let key = prev.key();

        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut leases = txn.open_table(LEASES).map_err(Error::storage)?;
            leases.remove(key.as_str()).map_err(Error::storage)?;

            let mut mac_idx = txn.open_table(INDEX_MAC).map_err(Error::storage)?;
            mac_idx
                .remove(prev.mac.to_string().as_str())
                .map_err(Error::storage)?;
            if let Some(id) = &prev.client_id {
                let mut id_idx = txn.open_table(INDEX_CLIENT_ID).map_err(Error::storage)?;
                id_idx
                    .remove(hex::encode(id).as_str())
                    .map_err(Error::storage)?;
            }
            if let Some(host) = &prev.hostname {
                let mut host_idx = txn.open_table(INDEX_HOSTNAME).map_err(Error::storage)?;
                host_idx
                    .remove(host.to_lowercase().as_str())
                    .map_err(Error::storage)?;
            }
        }
        txn.commit().map_err(Error::storage)?;

        index.remove(&prev);
        metrics::ACTIVE_LEASES.set(index.by_ip.len() as i64);
        debug!(ip = %ip, "lease deleted");
        Ok(Some(prev))
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.index.read().by_ip.get(&ip).cloned()
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<Lease> {
        let index = self.index.read();
        let ip = index.by_mac.get(&mac)?;
        index.by_ip.get(ip).cloned()
    }

    pub fn get_by_client_id(&self, id: &[u8]) -> Option<Lease> {
        let index = self.index.read();
        let ip = index.by_client_id.get(&hex::encode(id))?;
        index.by_ip.get(ip).cloned()
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Lease> {
        let index = self.index.read();
        let ip = index.by_hostname.get(&hostname.to_lowercase())?;
        index.by_ip.get(ip).cloned()
    }

    /// Snapshot of every lease, unordered.
    pub fn all_leases(&self) -> Vec<Lease> {
        self.index.read().by_ip.values().cloned().collect()
    }

    pub fn lease_count(&self) -> usize {
        self.index.read().by_ip.len()
    }

    // --- raw bucket operations ---

    /// Insert or replace `key` in `bucket`.
    pub fn put(&self, bucket: &str, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(raw_def(bucket)).map_err(Error::storage)?;
            table.insert(key, value).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        let read = self.db.begin_read().map_err(Error::storage)?;
        let table = read.open_table(raw_def(bucket)).map_err(Error::storage)?;
        Ok(table
            .get(key)
            .map_err(Error::storage)?
            .map(|v| v.value().to_string()))
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = txn.open_table(raw_def(bucket)).map_err(Error::storage)?;
            table.remove(key).map_err(Error::storage)?;
        }
        txn.commit().map_err(Error::storage)
    }

    /// Visit every entry of `bucket` in key order.
    pub fn for_each(&self, bucket: &str, mut f: impl FnMut(&str, &str)) -> Result<()> {
        let read = self.db.begin_read().map_err(Error::storage)?;
        let table = read.open_table(raw_def(bucket)).map_err(Error::storage)?;
        for entry in table.iter().map_err(Error::storage)? {
            let (key, value) = entry.map_err(Error::storage)?;
            f(key.value(), value.value());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("leases.redb"), &["config_subnets"]).unwrap();
        (store, dir)
    }

    fn lease(ip: [u8; 4], mac: &str, seq: u64) -> Lease {
        Lease {
            ip: Ipv4Addr::from(ip),
            mac: mac.parse().unwrap(),
            client_id: Some(vec![1, ip[3]]),
            hostname: Some(format!("host-{}", ip[3])),
            fqdn: None,
            subnet: "192.168.1.0/24".parse().unwrap(),
            pool: None,
            state: LeaseState::Active,
            starts_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(12),
            updated_at: Utc::now(),
            update_seq: seq,
            options: BTreeMap::new(),
            relay: RelayInfo::default(),
        }
    }

    #[test]
    #[traced_test]
    fn put_get_delete_round_trip() {
        let (store, _dir) = test_store();
        let l = lease([192, 168, 1, 100], "00:11:22:33:44:55", 1);
        store.put_lease(&l).unwrap();

        assert_eq!(store.get_by_ip(l.ip).unwrap().ip, l.ip);
        assert_eq!(store.get_by_mac(l.mac).unwrap().ip, l.ip);
        assert_eq!(store.get_by_client_id(&[1, 100]).unwrap().ip, l.ip);
        assert_eq!(store.get_by_hostname("HOST-100").unwrap().ip, l.ip);

        let removed = store.delete_lease(l.ip).unwrap().unwrap();
        assert_eq!(removed.ip, l.ip);
        assert!(store.get_by_ip(l.ip).is_none());
        assert!(store.get_by_mac(l.mac).is_none());
        assert!(store.get_by_hostname("host-100").is_none());
    }

    #[test]
    #[traced_test]
    fn indices_unique_per_key() {
        let (store, _dir) = test_store();
        store
            .put_lease(&lease([192, 168, 1, 100], "00:11:22:33:44:55", 1))
            .unwrap();
        // same IP, new MAC and hostname: old index rows must disappear
        let mut updated = lease([192, 168, 1, 100], "aa:bb:cc:dd:ee:ff", 2);
        updated.hostname = Some("renamed".into());
        updated.client_id = None;
        store.put_lease(&updated).unwrap();

        assert!(store.get_by_mac("00:11:22:33:44:55".parse().unwrap()).is_none());
        assert!(store.get_by_hostname("host-100").is_none());
        assert!(store.get_by_client_id(&[1, 100]).is_none());
        assert_eq!(
            store
                .get_by_mac("aa:bb:cc:dd:ee:ff".parse().unwrap())
                .unwrap()
                .update_seq,
            2
        );
    }

    #[test]
    #[traced_test]
    fn replay_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leases.redb");
        {
            let store = Store::open(&path, &[]).unwrap();
            store
                .put_lease(&lease([192, 168, 1, 100], "00:11:22:33:44:55", 9))
                .unwrap();
            store
                .put_lease(&lease([192, 168, 1, 101], "00:11:22:33:44:56", 10))
                .unwrap();
        }
        let store = Store::open(&path, &[]).unwrap();
        assert_eq!(store.lease_count(), 2);
        // sequence resumes above the persisted high-water mark
        assert!(store.next_seq() > 10);
    }

    #[test]
    fn sequence_monotonic() {
        let (store, _dir) = test_store();
        let mut last = 0;
        for _ in 0..100 {
            let seq = store.next_seq();
            assert!(seq > last);
            last = seq;
        }
        store.observe_seq(10_000);
        assert!(store.next_seq() > 10_000);
    }

    #[test]
    fn raw_bucket_ops() {
        let (store, _dir) = test_store();
        store.put(BUCKET_USERS, "admin", "{\"role\":\"admin\"}").unwrap();
        store.put("config_subnets", "current", "[]").unwrap();
        assert_eq!(
            store.get(BUCKET_USERS, "admin").unwrap().unwrap(),
            "{\"role\":\"admin\"}"
        );
        let mut seen = vec![];
        store
            .for_each(BUCKET_USERS, |k, _v| seen.push(k.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["admin"]);
        store.delete(BUCKET_USERS, "admin").unwrap();
        assert!(store.get(BUCKET_USERS, "admin").unwrap().is_none());
    }
}
