//! Per-client deny and override policies
//!
//! Both maps key on normalized domain names. Deny entries match the exact
//! name and every strict parent suffix; overrides match the exact name
//! only. Each entry carries an optional client predicate so a policy can be
//! scoped to specific source addresses or subnets.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;

use ipnet::IpNet;

/// Client predicate attached to a deny or override entry.
///
/// An empty rule applies to every client. A non-empty rule matches when the
/// client address equals a listed IP or falls inside a listed subnet; a
/// request without a known peer address never matches a non-empty rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRule {
    pub ips: Vec<IpAddr>,
    pub subnets: Vec<IpNet>,
}

impl ClientRule {
    pub fn is_unrestricted(&self) -> bool {
        self.ips.is_empty() && self.subnets.is_empty()
    }

    pub fn matches(&self, client: Option<IpAddr>) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        let client = match client {
            Some(client) => client,
            None => return false,
        };
        self.ips.contains(&client) || self.subnets.iter().any(|net| net.contains(&client))
    }
}

/// A domain→address override, answered before any upstream is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideEntry {
    /// Address returned in the synthesized A record.
    pub answer: Ipv4Addr,
    /// Which clients the override applies to.
    pub clients: ClientRule,
}

struct Maps {
    blocked: HashMap<String, ClientRule>,
    overrides: HashMap<String, OverrideEntry>,
}

/// Deny set and override map owned by the resolver.
///
/// Lookups are read-mostly. The write lock is held only while a batch of
/// block-list entries is inserted; overrides are fixed at construction and
/// the deny set only ever grows.
pub struct PolicyStore {
    maps: RwLock<Maps>,
}

impl PolicyStore {
    pub fn new(overrides: HashMap<String, OverrideEntry>) -> Self {
        Self {
            maps: RwLock::new(Maps {
                blocked: HashMap::new(),
                overrides,
            }),
        }
    }

    /// Insert a batch of deny entries under one write-lock acquisition.
    /// Keys must already be normalized.
    pub fn add_blocked_batch(&self, entries: impl IntoIterator<Item = (String, ClientRule)>) {
        let mut maps = self.maps.write().unwrap();
        for (domain, rule) in entries {
            maps.blocked.insert(domain, rule);
        }
    }

    /// Insert a single deny entry. Key must already be normalized.
    pub fn add_blocked(&self, domain: String, rule: ClientRule) {
        self.add_blocked_batch([(domain, rule)]);
    }

    /// Whether `domain` is denied for this client, either by an exact entry
    /// or by an entry for any strict parent suffix.
    pub fn is_blocked(&self, domain: &str, client: Option<IpAddr>) -> bool {
        let maps = self.maps.read().unwrap();

        if let Some(rule) = maps.blocked.get(domain) {
            if rule.matches(client) {
                return true;
            }
        }

        // Walk parent suffixes at label boundaries without splitting the
        // name into parts.
        let bytes = domain.as_bytes();
        for i in 0..bytes.len() {
            if bytes[i] == b'.' && i + 1 < bytes.len() {
                if let Some(rule) = maps.blocked.get(&domain[i + 1..]) {
                    if rule.matches(client) {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Exact-match override lookup. Suffixes do not apply to overrides.
    pub fn lookup_override(&self, domain: &str, client: Option<IpAddr>) -> Option<Ipv4Addr> {
        let maps = self.maps.read().unwrap();
        let entry = maps.overrides.get(domain)?;
        if entry.clients.matches(client) {
            Some(entry.answer)
        } else {
            None
        }
    }

    pub fn blocked_len(&self) -> usize {
        self.maps.read().unwrap().blocked.len()
    }

    pub fn override_len(&self) -> usize {
        self.maps.read().unwrap().overrides.len()
    }
}
