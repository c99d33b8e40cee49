//! TTL-driven response cache.
//!
//! Positive entries live for the minimum TTL of their answer records,
//! bounded below by the configured floor; negative answers (NXDOMAIN /
//! empty) are held for at most thirty seconds.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::records::{DnsRecord, RecordType};

const NEGATIVE_TTL_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CacheEntry {
    records: Vec<DnsRecord>,
    rcode: u8,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }

    fn records_with_remaining_ttl(&self) -> Vec<DnsRecord> {
        let elapsed = self.inserted_at.elapsed().as_secs() as u32;
        self.records
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.ttl = r.ttl.saturating_sub(elapsed);
                r
            })
            .collect()
    }
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct CacheKey {
    name: String,
    qtype: u16,
}

/// A cached answer: the records plus the rcode they came with.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub records: Vec<DnsRecord>,
    pub rcode: u8,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
    min_ttl: Duration,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize, min_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_entries.min(4_096))),
            max_entries,
            min_ttl,
        }
    }

    pub fn get(&self, name: &str, qtype: RecordType) -> Option<CachedAnswer> {
        let key = CacheKey {
            name: name.to_lowercase(),
            qtype: qtype.to_u16(),
        };
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.is_expired() {
            return None;
        }
        Some(CachedAnswer {
            records: entry.records_with_remaining_ttl(),
            rcode: entry.rcode,
        })
    }

    /// Cache an upstream answer. Negative responses (no records, or an
    /// error rcode) are capped at thirty seconds.
    pub fn insert(&self, name: &str, qtype: RecordType, records: &[DnsRecord], rcode: u8) {
        let ttl = if records.is_empty() || rcode != 0 {
            NEGATIVE_TTL_CAP
        } else {
            let min = records.iter().map(|r| r.ttl).min().unwrap_or(0) as u64;
            Duration::from_secs(min).max(self.min_ttl)
        };

        let key = CacheKey {
            name: name.to_lowercase(),
            qtype: qtype.to_u16(),
        };
        let entry = CacheEntry {
            records: records.to_vec(),
            rcode,
            inserted_at: Instant::now(),
            ttl,
        };

        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries {
            entries.retain(|_, v| !v.is_expired());
        }
        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, entry);
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
