//! Blocklist / allowlist pipeline.
//!
//! Lists download from their configured URLs on per-list refresh
//! intervals (clamped to at least one minute). Lookup order: allowlists
//! first (any match wins), then blocklists with a parent-domain walk, so
//! blocking `b.c` also blocks `a.b.c`.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dynconfig::{BlockAction, BlocklistSource, ListFormat};
use haven_core::prelude::*;

const MIN_REFRESH: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Parse one list body. Comments and wildcard rules are skipped.
pub fn parse_list(content: &str, format: ListFormat) -> Vec<String> {
    match format {
        ListFormat::Hosts => content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let mut parts = line.split_whitespace();
                let addr = parts.next()?;
                if addr != "0.0.0.0" && addr != "127.0.0.1" {
                    return None;
                }
                let name = parts.next()?;
                valid_domain(name).then(|| name.to_lowercase())
            })
            .collect(),
        ListFormat::Domains => content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                valid_domain(line).then(|| line.to_lowercase())
            })
            .collect(),
        ListFormat::Adblock => content
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                // only plain ||name^ rules; element hiding, wildcard and
                // exception syntax is out of scope for a DNS blocker
                let rest = line.strip_prefix("||")?;
                let name = rest.strip_suffix('^')?;
                if name.contains('*') || name.contains('/') {
                    return None;
                }
                valid_domain(name).then(|| name.to_lowercase())
            })
            .collect(),
    }
}

fn valid_domain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && !name.contains('*')
        && name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

#[derive(Default)]
struct Lists {
    allow: HashSet<String>,
    // name -> answer for a hit
    block: HashMap<String, BlockAction>,
}

/// The compiled allow/block state plus the refresher.
pub struct Blocklists {
    lists: RwLock<Lists>,
    sources: RwLock<Vec<BlocklistSource>>,
}

impl std::fmt::Debug for Blocklists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.read();
        f.debug_struct("Blocklists")
            .field("blocked", &lists.block.len())
            .field("allowed", &lists.allow.len())
            .finish()
    }
}

impl Blocklists {
    pub fn new(sources: Vec<BlocklistSource>) -> Self {
        Self {
            lists: RwLock::new(Lists::default()),
            sources: RwLock::new(sources),
        }
    }

    pub fn set_sources(&self, sources: Vec<BlocklistSource>) {
        *self.sources.write() = sources;
    }

    /// Feed parsed entries for one source into the live state.
    pub fn load_entries(&self, source: &BlocklistSource, names: Vec<String>) {
        let mut lists = self.lists.write();
        if source.allow {
            lists.allow.extend(names);
        } else {
            for name in names {
                lists.block.entry(name).or_insert(source.action);
            }
        }
    }

    /// Drop everything and re-ingest (used by the refresher so removed
    /// entries actually disappear).
    fn replace_all(&self, batches: Vec<(BlocklistSource, Vec<String>)>) {
        let mut fresh = Lists::default();
        for (source, names) in batches {
            if source.allow {
                fresh.allow.extend(names);
            } else {
                for name in names {
                    fresh.block.entry(name).or_insert(source.action);
                }
            }
        }
        info!(
            blocked = fresh.block.len(),
            allowed = fresh.allow.len(),
            "blocklists refreshed"
        );
        *self.lists.write() = fresh;
    }

    /// The verdict for a query name: `None` to resolve normally, or the
    /// blocking action. Allowlists win, then the blocklist parent-domain
    /// walk applies.
    pub fn check(&self, name: &str) -> Option<BlockAction> {
        let name = name.to_lowercase();
        let lists = self.lists.read();

        let mut walk = name.as_str();
        loop {
            if lists.allow.contains(walk) {
                return None;
            }
            match walk.find('.') {
                Some(pos) => walk = &walk[pos + 1..],
                None => break,
            }
        }
        let mut walk = name.as_str();
        loop {
            if let Some(action) = lists.block.get(walk) {
                return Some(*action);
            }
            match walk.find('.') {
                Some(pos) => walk = &walk[pos + 1..],
                None => break,
            }
        }
        None
    }

    pub fn blocked_count(&self) -> usize {
        self.lists.read().block.len()
    }

    async fn download(source: &BlocklistSource) -> Result<Vec<String>> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::PeerUnavailable(format!("building http client: {e}")))?;
        let body = client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| Error::PeerUnavailable(format!("fetching {}: {e}", source.url)))?
            .text()
            .await
            .map_err(|e| Error::PeerUnavailable(format!("reading {}: {e}", source.url)))?;
        Ok(parse_list(&body, source.format))
    }

    async fn refresh_all(&self) {
        let sources = self.sources.read().clone();
        let mut batches = Vec::with_capacity(sources.len());
        for source in sources {
            match Self::download(&source).await {
                Ok(names) => {
                    debug!(list = %source.name, entries = names.len(), "list downloaded");
                    batches.push((source, names));
                }
                Err(err) => {
                    warn!(list = %source.name, %err, "list download failed, keeping old entries");
                    return;
                }
            }
        }
        self.replace_all(batches);
    }
}

/// The refresh loop. The shortest configured per-list interval paces
/// the sweep; each list refreshes once its own interval has elapsed.
pub async fn run_refresher(lists: Arc<Blocklists>, cancel: CancellationToken) {
    use std::time::Instant;
    let mut last_run: HashMap<String, Instant> = HashMap::new();
    loop {
        let tick = {
            let sources = lists.sources.read();
            sources
                .iter()
                .map(|s| Duration::from_secs(s.refresh_secs).max(MIN_REFRESH))
                .min()
                .unwrap_or(Duration::from_secs(3_600))
        };
        let due = {
            let sources = lists.sources.read();
            sources.iter().any(|s| {
                let interval = Duration::from_secs(s.refresh_secs).max(MIN_REFRESH);
                last_run
                    .get(&s.name)
                    .map(|t| t.elapsed() >= interval)
                    .unwrap_or(true)
            })
        };
        if due {
            lists.refresh_all().await;
            let now = Instant::now();
            for s in lists.sources.read().iter() {
                last_run.insert(s.name.clone(), now);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = cancel.cancelled() => break,
        }
    }
}
