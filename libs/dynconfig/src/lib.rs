//! # dynconfig
//!
//! The dynamic configuration store. Every section lives as one JSON blob
//! in its own bucket; replacing a section is the only write operation.
//! Listeners come in two flavours: `on_change` fires (debounced) after any
//! mutation, local or peer-originated; `on_local_change` fires immediately
//! and only for local mutations, and feeds HA replication.
//!
//! Server identity and HA node identity are bootstrap settings in an
//! external TOML file (see [`bootstrap`]) and are never replicated.
#![warn(rust_2018_idioms, unreachable_pub)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use haven_core::prelude::*;
use store::Store;

pub mod bootstrap;
pub mod sections;

pub use bootstrap::{Bootstrap, HaIdentity, NodeRole, ServerIdentity, TlsIdentity};
pub use sections::*;

/// Debounce window for `on_change`; a burst of section writes (for
/// example a seven-section snapshot from the peer) collapses into one
/// notification.
pub const CHANGE_DEBOUNCE: Duration = Duration::from_millis(100);

const SECTION_KEY: &str = "current";

/// Identifies one dynamic config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Subnets,
    Defaults,
    ConflictDetection,
    Hooks,
    Ddns,
    DnsProxy,
    Sanitizer,
    Fingerprint,
    Syslog,
    PortRules,
    Vips,
    Users,
}

impl Section {
    pub const ALL: [Section; 12] = [
        Section::Subnets,
        Section::Defaults,
        Section::ConflictDetection,
        Section::Hooks,
        Section::Ddns,
        Section::DnsProxy,
        Section::Sanitizer,
        Section::Fingerprint,
        Section::Syslog,
        Section::PortRules,
        Section::Vips,
        Section::Users,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Section::Subnets => "subnets",
            Section::Defaults => "defaults",
            Section::ConflictDetection => "conflict_detection",
            Section::Hooks => "hooks",
            Section::Ddns => "ddns",
            Section::DnsProxy => "dns_proxy",
            Section::Sanitizer => "sanitizer",
            Section::Fingerprint => "fingerprint",
            Section::Syslog => "syslog",
            Section::PortRules => "port_rules",
            Section::Vips => "vips",
            Section::Users => "users",
        }
    }

    pub fn bucket(&self) -> &'static str {
        match self {
            Section::Subnets => "config_subnets",
            Section::Defaults => "config_defaults",
            Section::ConflictDetection => "config_conflict_detection",
            Section::Hooks => "config_hooks",
            Section::Ddns => "config_ddns",
            Section::DnsProxy => "config_dns_proxy",
            Section::Sanitizer => "config_sanitizer",
            Section::Fingerprint => "config_fingerprint",
            Section::Syslog => "config_syslog",
            Section::PortRules => "config_port_rules",
            Section::Vips => "config_vips",
            Section::Users => "config_users",
        }
    }

    pub fn from_name(name: &str) -> Option<Section> {
        Section::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Bucket names for [`Store::open`].
    pub fn buckets() -> Vec<&'static str> {
        Section::ALL.iter().map(|s| s.bucket()).collect()
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The fully-typed configuration, one field per section.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub conflict_detection: ConflictParams,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub ddns: DdnsConfig,
    #[serde(default)]
    pub dns_proxy: DnsProxyConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub syslog: SyslogConfig,
    #[serde(default)]
    pub port_rules: PortRulesConfig,
    #[serde(default)]
    pub vips: VipsConfig,
    #[serde(default)]
    pub users: UsersConfig,
}

impl Config {
    fn section_json(&self, section: Section) -> Result<String> {
        fn enc<T: Serialize>(v: &T) -> Result<String> {
            serde_json::to_string(v).map_err(Error::storage)
        }
        match section {
            Section::Subnets => enc(&self.subnets),
            Section::Defaults => enc(&self.defaults),
            Section::ConflictDetection => enc(&self.conflict_detection),
            Section::Hooks => enc(&self.hooks),
            Section::Ddns => enc(&self.ddns),
            Section::DnsProxy => enc(&self.dns_proxy),
            Section::Sanitizer => enc(&self.sanitizer),
            Section::Fingerprint => enc(&self.fingerprint),
            Section::Syslog => enc(&self.syslog),
            Section::PortRules => enc(&self.port_rules),
            Section::Vips => enc(&self.vips),
            Section::Users => enc(&self.users),
        }
    }

    /// Parse, validate and apply one section from JSON.
    fn apply_section_json(&mut self, section: Section, json: &str) -> Result<()> {
        fn dec<T: DeserializeOwned>(json: &str) -> Result<T> {
            serde_json::from_str(json)
                .map_err(|e| Error::validation(format!("malformed section: {e}")))
        }
        match section {
            Section::Subnets => {
                let subnets: Vec<Subnet> = dec(json)?;
                for subnet in &subnets {
                    subnet.validate()?;
                }
                self.subnets = subnets;
            }
            Section::Defaults => self.defaults = dec(json)?,
            Section::ConflictDetection => self.conflict_detection = dec(json)?,
            Section::Hooks => self.hooks = dec(json)?,
            Section::Ddns => self.ddns = dec(json)?,
            Section::DnsProxy => self.dns_proxy = dec(json)?,
            Section::Sanitizer => self.sanitizer = dec(json)?,
            Section::Fingerprint => self.fingerprint = dec(json)?,
            Section::Syslog => self.syslog = dec(json)?,
            Section::PortRules => self.port_rules = dec(json)?,
            Section::Vips => self.vips = dec(json)?,
            Section::Users => self.users = dec(json)?,
        }
        Ok(())
    }
}

type ChangeListener = Box<dyn Fn() + Send + Sync>;
type LocalListener = Box<dyn Fn(Section, &str) + Send + Sync>;

struct Listeners {
    on_change: Vec<ChangeListener>,
    on_local_change: Vec<LocalListener>,
}

/// The dynamic config store.
#[derive(Clone)]
pub struct ConfigStore {
    store: Store,
    cached: Arc<RwLock<Config>>,
    listeners: Arc<Mutex<Listeners>>,
    change_tx: mpsc::UnboundedSender<()>,
    change_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<()>>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("subnets", &self.cached.read().subnets.len())
            .finish()
    }
}

impl ConfigStore {
    /// Load every persisted section from `store`; sections that were
    /// never written fall back to their defaults.
    pub fn load(store: Store) -> Result<Self> {
        let mut config = Config::default();
        for section in Section::ALL {
            match store.get(section.bucket(), SECTION_KEY)? {
                Some(json) => {
                    if let Err(err) = config.apply_section_json(section, &json) {
                        error!(%section, %err, "stored config section is invalid, using default");
                    }
                }
                None => debug!(%section, "no stored value, using default"),
            }
        }
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Ok(Self {
            store,
            cached: Arc::new(RwLock::new(config)),
            listeners: Arc::new(Mutex::new(Listeners {
                on_change: Vec::new(),
                on_local_change: Vec::new(),
            })),
            change_tx,
            change_rx: Arc::new(Mutex::new(Some(change_rx))),
        })
    }

    /// Spawn the debounced `on_change` dispatcher.
    pub fn start(&self, cancel: CancellationToken) {
        let mut rx = self
            .change_rx
            .lock()
            .take()
            .expect("config change dispatcher already started");
        let listeners = Arc::clone(&self.listeners);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    first = rx.recv() => {
                        if first.is_none() {
                            break;
                        }
                        // coalesce the burst
                        loop {
                            tokio::select! {
                                _ = tokio::time::sleep(CHANGE_DEBOUNCE) => break,
                                more = rx.recv() => {
                                    if more.is_none() {
                                        break;
                                    }
                                }
                            }
                        }
                        for f in listeners.lock().on_change.iter() {
                            f();
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("config change dispatcher stopped");
        });
    }

    /// Register a listener fired (debounced) after any mutation.
    pub fn on_change(&self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().on_change.push(Box::new(f));
    }

    /// Register a listener fired immediately for locally-initiated
    /// mutations only. Consumed by the HA controller.
    pub fn on_local_change(&self, f: impl Fn(Section, &str) + Send + Sync + 'static) {
        self.listeners.lock().on_local_change.push(Box::new(f));
    }

    /// Current config snapshot.
    pub fn config(&self) -> Config {
        self.cached.read().clone()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.cached.read().subnets.clone()
    }

    pub fn defaults(&self) -> Defaults {
        self.cached.read().defaults.clone()
    }

    pub fn conflict_params(&self) -> ConflictParams {
        self.cached.read().conflict_detection.clone()
    }

    pub fn dns_proxy(&self) -> DnsProxyConfig {
        self.cached.read().dns_proxy.clone()
    }

    pub fn ddns(&self) -> DdnsConfig {
        self.cached.read().ddns.clone()
    }

    pub fn port_rules(&self) -> PortRulesConfig {
        self.cached.read().port_rules.clone()
    }

    pub fn users(&self) -> UsersConfig {
        self.cached.read().users.clone()
    }

    /// The subnet containing `ip`, if any.
    pub fn subnet_for(&self, ip: std::net::Ipv4Addr) -> Option<Subnet> {
        self.cached
            .read()
            .subnets
            .iter()
            .find(|s| s.cidr.contains(&ip))
            .cloned()
    }

    /// Sanitiser settings for `subnet`: the per-subnet override replaces
    /// the global pipeline wholesale.
    pub fn sanitizer_for(&self, subnet: Option<&Ipv4Net>) -> SanitizerConfig {
        let cfg = self.cached.read();
        if let Some(subnet) = subnet {
            if let Some(s) = cfg.subnets.iter().find(|s| &s.cidr == subnet) {
                if let Some(over) = &s.sanitizer {
                    return over.clone();
                }
            }
        }
        cfg.sanitizer.clone()
    }

    /// Every reservation across all subnets, paired with its subnet.
    pub fn reservations(&self) -> Vec<(Ipv4Net, Reservation)> {
        self.cached
            .read()
            .subnets
            .iter()
            .flat_map(|s| s.reservations.iter().map(|r| (s.cidr, r.clone())))
            .collect()
    }

    /// Replace one section from a typed value (local mutation).
    pub fn replace_section<T: Serialize>(&self, section: Section, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(Error::storage)?;
        self.replace_section_json(section, &json, true)
    }

    /// Apply a section received from the HA peer. Writes through to
    /// storage and fires only `on_change`, never `on_local_change`.
    pub fn apply_peer_section(&self, section: Section, json: &str) -> Result<()> {
        self.replace_section_json(section, json, false)
    }

    fn replace_section_json(&self, section: Section, json: &str, local: bool) -> Result<()> {
        {
            let mut cached = self.cached.write();
            let mut next = cached.clone();
            next.apply_section_json(section, json)?;
            // canonical encoding, not the caller's formatting
            let canonical = next.section_json(section)?;
            self.store.put(section.bucket(), SECTION_KEY, &canonical)?;
            *cached = next;
        }
        if local {
            for f in self.listeners.lock().on_local_change.iter() {
                f(section, json);
            }
        }
        if self.change_tx.send(()).is_err() {
            warn!(%section, "config change dispatcher not running");
        }
        debug!(%section, local, "config section replaced");
        Ok(())
    }

    /// Import a full config atomically. Each section write goes through
    /// the same path as single-section updates, so listeners fire
    /// uniformly. Used for bootstrap-TOML migration and backup restore.
    pub fn import(&self, config: &Config) -> Result<()> {
        for subnet in &config.subnets {
            subnet.validate()?;
        }
        for section in Section::ALL {
            let json = config.section_json(section)?;
            self.replace_section_json(section, &json, true)?;
        }
        Ok(())
    }

    /// Serialized snapshot of every section, for HA snapshot streaming.
    pub fn snapshot_sections(&self) -> Result<Vec<(Section, String)>> {
        let cached = self.cached.read();
        Section::ALL
            .iter()
            .map(|&s| Ok((s, cached.section_json(s)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_cfg() -> (ConfigStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("db.redb"), &Section::buckets()).unwrap();
        (ConfigStore::load(store).unwrap(), dir)
    }

    fn one_subnet() -> Vec<Subnet> {
        vec![Subnet {
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
            reservations: vec![],
            lease_time_secs: None,
            options: Default::default(),
            sanitizer: None,
        }]
    }

    #[test]
    fn replace_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.redb");
        {
            let store = Store::open(&path, &Section::buckets()).unwrap();
            let cfg = ConfigStore::load(store).unwrap();
            cfg.replace_section(Section::Subnets, &one_subnet()).unwrap();
        }
        let store = Store::open(&path, &Section::buckets()).unwrap();
        let cfg = ConfigStore::load(store).unwrap();
        assert_eq!(cfg.subnets().len(), 1);
        assert_eq!(cfg.subnets()[0].pools[0].name, "main");
    }

    #[test]
    fn invalid_section_rejected_and_cache_untouched() {
        let (cfg, _dir) = test_cfg();
        let mut bad = one_subnet();
        bad[0].pools[0].end = Ipv4Addr::new(10, 0, 0, 1);
        assert!(cfg.replace_section(Section::Subnets, &bad).is_err());
        assert!(cfg.subnets().is_empty());
    }

    #[test]
    fn local_listener_only_fires_for_local_writes() {
        let (cfg, _dir) = test_cfg();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        cfg.on_local_change(move |section, _| {
            assert_eq!(section, Section::Defaults);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        cfg.replace_section(Section::Defaults, &Defaults::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let json = serde_json::to_string(&Defaults::default()).unwrap();
        cfg.apply_peer_section(Section::Defaults, &json).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn change_burst_debounces_to_one() {
        let (cfg, _dir) = test_cfg();
        let cancel = CancellationToken::new();
        cfg.start(cancel.clone());

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        cfg.on_change(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // replicate a multi-section snapshot: one rebuild expected
        for section in [
            Section::Defaults,
            Section::Ddns,
            Section::DnsProxy,
            Section::Sanitizer,
            Section::Syslog,
            Section::Vips,
            Section::Users,
        ] {
            let json = cfg.config().section_json(section).unwrap();
            cfg.apply_peer_section(section, &json).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[test]
    fn subnet_lookup() {
        let (cfg, _dir) = test_cfg();
        cfg.replace_section(Section::Subnets, &one_subnet()).unwrap();
        assert!(cfg.subnet_for(Ipv4Addr::new(192, 168, 1, 42)).is_some());
        assert!(cfg.subnet_for(Ipv4Addr::new(10, 0, 0, 1)).is_none());
    }

    #[test]
    fn import_fires_listeners_per_section() {
        let (cfg, _dir) = test_cfg();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        cfg.on_local_change(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        cfg.import(&Config::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), Section::ALL.len());
    }
}
