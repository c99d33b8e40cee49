//! In-memory query log: a fixed-capacity ring with live subscribers for
//! server-sent-event streaming. Slow subscribers are dropped and
//! disconnected rather than ever backpressuring the resolver.
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 1_000;
const SUBSCRIBER_BUFFER: usize = 256;

/// How one query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryDisposition {
    Local,
    Cached,
    Forwarded,
    Blocked,
    Failed,
}

/// One log line.
#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    pub at: DateTime<Utc>,
    pub name: String,
    pub qtype: String,
    pub client: String,
    pub disposition: QueryDisposition,
    pub elapsed_ms: u64,
}

/// The ring plus its subscribers.
pub struct QueryLog {
    capacity: usize,
    ring: Mutex<VecDeque<QueryLogEntry>>,
    subscribers: Mutex<Vec<mpsc::Sender<QueryLogEntry>>>,
}

impl std::fmt::Debug for QueryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLog")
            .field("entries", &self.ring.lock().len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl QueryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Append an entry and fan it out. A subscriber whose buffer is full
    /// is disconnected on the spot.
    pub fn add(&self, entry: QueryLogEntry) {
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("query log subscriber dropped (slow or gone)");
                false
            }
        });
    }

    /// The most recent `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<QueryLogEntry> {
        let ring = self.ring.lock();
        ring.iter().rev().take(n).cloned().collect()
    }

    /// Register a live subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<QueryLogEntry> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}
