//! DNS response caching with separate positive and negative policies
//!
//! Entries are keyed by the query fingerprint (normalized QNAME, QTYPE,
//! QCLASS) and hold the full reply as received. Positive answers are capped
//! at the configured positive TTL and the smallest answer-record TTL;
//! negative answers honour the SOA MINIMUM. When the entry cap is reached
//! the entry closest to expiry is evicted, and a background sweeper drops
//! expired entries every 30 seconds.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, RData, RecordType};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::message::{is_negative, response_matches, restamp};
use crate::name::normalize;

/// How often the expiry sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Cache and coalesce key: (normalized QNAME, QTYPE, QCLASS).
///
/// Queries that differ only in transaction ID, header flags, or EDNS
/// content share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
}

impl QueryKey {
    /// Derive the key from a message's first question, if it has one.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let query = msg.queries().first()?;
        Some(Self {
            name: normalize(&query.name().to_string()),
            qtype: query.query_type(),
            qclass: query.query_class(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.name,
            u16::from(self.qtype),
            u16::from(self.qclass)
        )
    }
}

struct CacheEntry {
    message: Message,
    expires_at: Instant,
}

/// In-memory response cache shared by all handler tasks.
pub struct ResponseCache {
    entries: RwLock<HashMap<QueryKey, CacheEntry>>,
    positive_ttl: u64,
    negative_ttl: u64,
    max_entries: usize,
}

impl ResponseCache {
    /// TTLs are in seconds; zero disables the corresponding policy.
    /// `max_entries` of zero means unbounded.
    pub fn new(positive_ttl: u64, negative_ttl: u64, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            positive_ttl,
            negative_ttl,
            max_entries,
        }
    }

    pub fn enabled(&self) -> bool {
        self.positive_ttl > 0 || self.negative_ttl > 0
    }

    pub fn positive_enabled(&self) -> bool {
        self.positive_ttl > 0
    }

    /// Look up a live entry for the request's fingerprint.
    ///
    /// The stored reply is cloned with only the transaction ID, question
    /// section, RD, and CD rewritten for this caller. Expired entries are
    /// left in place for the sweeper.
    pub async fn get(&self, request: &Message) -> Option<Message> {
        if !self.enabled() {
            return None;
        }
        let key = QueryKey::from_message(request)?;
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(restamp(&entry.message, request))
    }

    /// Store a reply under the request's fingerprint, applying the positive
    /// or negative TTL policy. Replies whose question does not match the
    /// request are dropped.
    pub async fn put(&self, request: &Message, resp: &Message) {
        self.store(request, resp, false).await;
    }

    /// Like `put`, but inserts only when no live entry exists for the key.
    /// Used by coalesced followers that timed out, so a reply the leader
    /// already published is never replaced by a synthesized NXDOMAIN.
    pub async fn put_if_absent(&self, request: &Message, resp: &Message) {
        self.store(request, resp, true).await;
    }

    async fn store(&self, request: &Message, resp: &Message, only_if_absent: bool) {
        let key = match QueryKey::from_message(request) {
            Some(key) => key,
            None => return,
        };
        if !response_matches(request, resp) {
            debug!(key = %key, "response does not match query, not caching");
            return;
        }

        let ttl = if is_negative(resp) {
            self.negative_ttl_for(resp)
        } else {
            self.positive_ttl_for(resp)
        };
        let ttl = match ttl {
            Some(ttl) => ttl,
            None => return,
        };

        let mut entries = self.entries.write().await;
        if only_if_absent {
            if let Some(existing) = entries.get(&key) {
                if Instant::now() < existing.expires_at {
                    return;
                }
            }
        }
        if self.max_entries > 0
            && entries.len() >= self.max_entries
            && !entries.contains_key(&key)
        {
            evict_soonest(&mut entries);
        }
        debug!(key = %key, ttl, "cached");
        entries.insert(
            key,
            CacheEntry {
                message: resp.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
    }

    /// TTL for a negative reply: the configured ceiling, lowered by the
    /// first SOA's MINIMUM, or failing any SOA by the smallest authority
    /// TTL. Sub-second results are not cached.
    fn negative_ttl_for(&self, resp: &Message) -> Option<u64> {
        if self.negative_ttl == 0 {
            return None;
        }
        let mut ttl = self.negative_ttl;
        let mut soa_seen = false;
        for record in resp.name_servers() {
            if let RData::SOA(soa) = record.data() {
                soa_seen = true;
                let minimum = u64::from(soa.minimum());
                if minimum > 0 && minimum < ttl {
                    ttl = minimum;
                }
                break;
            }
        }
        if !soa_seen {
            for record in resp.name_servers() {
                let record_ttl = u64::from(record.ttl());
                if record_ttl > 0 && record_ttl < ttl {
                    ttl = record_ttl;
                }
            }
        }
        if ttl < 1 {
            return None;
        }
        Some(ttl)
    }

    /// TTL for a positive reply: the configured ceiling lowered by the
    /// smallest answer-record TTL. Errors, empty answers, and sub-second
    /// results are not cached.
    fn positive_ttl_for(&self, resp: &Message) -> Option<u64> {
        if self.positive_ttl == 0 {
            return None;
        }
        if resp.response_code() != ResponseCode::NoError || resp.answers().is_empty() {
            return None;
        }
        let mut ttl = self.positive_ttl;
        for record in resp.answers() {
            let record_ttl = u64::from(record.ttl());
            if record_ttl < ttl {
                ttl = record_ttl;
            }
        }
        if ttl < 1 {
            return None;
        }
        Some(ttl)
    }

    /// Remaining lifetime of the entry for this request's fingerprint.
    pub async fn remaining_ttl(&self, request: &Message) -> Option<Duration> {
        let key = QueryKey::from_message(request)?;
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }

    /// Remove every entry whose expiry has passed. Returns how many were
    /// dropped.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spawn the periodic expiry sweeper. It runs only while positive
    /// caching is enabled and stops when the shutdown signal fires.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.positive_enabled() {
            return;
        }
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep_expired().await;
                        if swept > 0 {
                            debug!(swept, "removed expired cache entries");
                        }
                    }
                }
            }
        });
    }
}

/// Drop the single entry closest to expiry. Called with the write lock
/// held, once per insertion that would overflow the cap.
fn evict_soonest(entries: &mut HashMap<QueryKey, CacheEntry>) {
    let soonest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = soonest {
        entries.remove(&key);
    }
}
