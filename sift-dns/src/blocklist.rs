//! Block-list ingestion and refresh
//!
//! Lists are hosts/adblock-style text files, local or fetched over HTTP.
//! Every domain in a list inherits the list's client restriction. URL-backed
//! lists are re-downloaded periodically; a refresh only ever adds entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::BlockListSource;
use crate::error::{Error, Result};
use crate::name::normalize;
use crate::policy::{ClientRule, PolicyStore};

/// Loads configured block lists into the policy store and keeps URL-backed
/// lists fresh.
pub struct BlockListLoader {
    policy: Arc<PolicyStore>,
    http: reqwest::Client,
    url_sources: Vec<BlockListSource>,
}

impl BlockListLoader {
    pub fn new(policy: Arc<PolicyStore>, http: reqwest::Client) -> Self {
        Self {
            policy,
            http,
            url_sources: Vec::new(),
        }
    }

    /// Load every configured source. A failing source is logged and skipped
    /// so one dead URL or missing file does not prevent startup.
    pub async fn load_all(&mut self, sources: &[BlockListSource]) {
        for source in sources {
            match self.load_one(source).await {
                Ok(count) => {
                    info!(source = %source.source, domains = count, "loaded block list");
                }
                Err(e) => {
                    warn!(source = %source.source, error = %e, "failed to load block list");
                }
            }
        }
    }

    async fn load_one(&mut self, source: &BlockListSource) -> Result<usize> {
        let text = if source.is_url() {
            // Remember URL-backed lists for periodic refresh.
            if !self.url_sources.iter().any(|s| s.source == source.source) {
                self.url_sources.push(source.clone());
            }
            self.download(&source.source).await?
        } else {
            tokio::fs::read_to_string(&source.source).await?
        };
        Ok(ingest(&self.policy, &text, &source.rule))
    }

    async fn download(&self, url: &str) -> Result<String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Dns(format!("failed to download {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(Error::Dns(format!(
                "failed to download {}: HTTP {}",
                url,
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| Error::Dns(format!("failed to read {}: {}", url, e)))
    }

    /// Spawn the periodic URL refresh task. Does nothing when no URL-backed
    /// list was loaded or the interval is zero.
    pub fn spawn_reloader(self, interval_minutes: u64, mut shutdown: broadcast::Receiver<()>) {
        if self.url_sources.is_empty() || interval_minutes == 0 {
            return;
        }
        info!(
            interval_minutes,
            lists = self.url_sources.len(),
            "block-list reloader started"
        );
        tokio::spawn(async move {
            let period = Duration::from_secs(interval_minutes * 60);
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => self.reload_urls().await,
                }
            }
        });
    }

    async fn reload_urls(&self) {
        debug!("reloading URL-based block lists");
        for source in &self.url_sources {
            match self.download(&source.source).await {
                Ok(text) => {
                    let count = ingest(&self.policy, &text, &source.rule);
                    info!(source = %source.source, domains = count, "reloaded block list");
                }
                Err(e) => {
                    warn!(source = %source.source, error = %e, "failed to reload block list");
                }
            }
        }
    }
}

/// Parse a list body and insert every domain in one batch under the policy
/// write lock. Returns the number of domains found.
fn ingest(policy: &PolicyStore, text: &str, rule: &ClientRule) -> usize {
    let mut batch = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(domain) = parse_host_line(line) {
            batch.push((normalize(domain), rule.clone()));
        }
    }
    let count = batch.len();
    policy.add_blocked_batch(batch);
    count
}

/// Extract the domain from one list line. Handles plain domains, adblock
/// `||domain^` markers, and `IP domain` hosts-file lines.
fn parse_host_line(line: &str) -> Option<&str> {
    let line = line.trim_start_matches("||");
    let line = line.trim_end_matches('^');
    let line = line.trim_end_matches('$');

    let mut fields = line.split_whitespace();
    let first = fields.next()?;

    // hosts-file form: "0.0.0.0 ads.example.com"
    if first.parse::<std::net::IpAddr>().is_ok() {
        if let Some(second) = fields.next() {
            return Some(second);
        }
    }

    let domain = first
        .trim_start_matches("||")
        .trim_end_matches('^')
        .trim_end_matches('$');
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}
