//! Domain name normalization
//!
//! Every policy and cache lookup keys on the normalized form of a name:
//! ASCII lowercase, surrounding whitespace removed, no trailing dot.

use std::sync::OnceLock;

use dashmap::DashMap;

/// Inputs at or above this length bypass the interning map.
const INTERN_LIMIT: usize = 256;

fn interned() -> &'static DashMap<String, String> {
    static INTERNED: OnceLock<DashMap<String, String>> = OnceLock::new();
    INTERNED.get_or_init(DashMap::new)
}

/// Normalize a domain name for comparison and keying.
///
/// Lowercases, trims surrounding whitespace, and strips a single trailing
/// dot. Idempotent. Results for short inputs are interned process-wide so
/// the hot path for repeated queries is a single map lookup.
pub fn normalize(domain: &str) -> String {
    if let Some(cached) = interned().get(domain) {
        return cached.value().clone();
    }

    let mut normalized = domain.trim().to_ascii_lowercase();
    if normalized.ends_with('.') {
        normalized.pop();
    }

    if normalized.len() < INTERN_LIMIT {
        interned().insert(domain.to_string(), normalized.clone());
        if normalized != domain {
            interned().insert(normalized.clone(), normalized.clone());
        }
    }

    normalized
}
