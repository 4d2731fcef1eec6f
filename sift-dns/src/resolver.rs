//! Query handling pipeline
//!
//! Each query is answered from the first source that applies: the response
//! cache, the deny list (NXDOMAIN), the override map (synthesized A), or an
//! upstream reached through the single-flight coalescer. Total upstream
//! failure becomes a cached NXDOMAIN.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::blocklist::BlockListLoader;
use crate::cache::{QueryKey, ResponseCache};
use crate::coalesce::{Coalescer, FlightRole, FOLLOWER_TIMEOUT};
use crate::config::Config;
use crate::error::Result;
use crate::forward::Forwarder;
use crate::http::build_http_client;
use crate::message::{nxdomain_reply, override_reply, restamp, servfail_reply};
use crate::name::normalize;
use crate::policy::PolicyStore;

/// Process-wide resolver owning the policy maps, cache, coalescer, and
/// upstream forwarder.
pub struct Resolver {
    policy: Arc<PolicyStore>,
    cache: Arc<ResponseCache>,
    coalescer: Arc<Coalescer>,
    forwarder: Forwarder,
    log_blocks: bool,
    log_overrides: bool,
}

impl Resolver {
    /// Build a resolver from configuration: parse upstreams and overrides,
    /// load block lists, and start the background sweepers and the URL
    /// reloader. Background tasks stop when `shutdown` fires.
    pub async fn new(config: &Config, shutdown: &broadcast::Sender<()>) -> Result<Self> {
        let upstreams = config.upstreams()?;
        let overrides = config.override_entries()?;
        let sources = config.block_list_sources()?;
        let policy = Arc::new(PolicyStore::new(overrides));

        // The bootstrap probe only matters when some source needs hostname
        // resolution before this server is in the resolution path.
        let needs_bootstrap = sources.iter().any(|s| s.is_url())
            || upstreams.iter().any(|u| u.address.parse::<IpAddr>().is_err());
        let http = build_http_client(config.fallback_dns, needs_bootstrap)?;

        let mut loader = BlockListLoader::new(policy.clone(), http.clone());
        loader.load_all(&sources).await;
        info!(
            blocked = policy.blocked_len(),
            overrides = policy.override_len(),
            upstreams = upstreams.len(),
            "resolver ready"
        );
        loader.spawn_reloader(config.reload_interval, shutdown.subscribe());

        let cache = Arc::new(ResponseCache::new(
            config.positive_ttl,
            config.negative_ttl,
            config.max_cache_entries,
        ));
        cache.clone().spawn_sweeper(shutdown.subscribe());

        let coalescer = Arc::new(Coalescer::new());
        coalescer.clone().spawn_sweeper(shutdown.subscribe());

        let forwarder = Forwarder::new(upstreams, http)?;

        Ok(Self {
            policy,
            cache,
            coalescer,
            forwarder,
            log_blocks: config.log_blocks,
            log_overrides: config.log_overrides,
        })
    }

    /// Answer one query. Returns the wire-format reply, or `None` when the
    /// query is dropped (unparseable or missing a question).
    pub async fn resolve(&self, query: &[u8], client: Option<IpAddr>) -> Option<Vec<u8>> {
        let request = match Message::from_vec(query) {
            Ok(request) => request,
            Err(e) => {
                debug!(client = ?client, error = %e, "dropping unparseable query");
                return None;
            }
        };
        let question = match request.queries().first() {
            Some(question) => question.clone(),
            None => {
                debug!(client = ?client, "dropping query without a question");
                return None;
            }
        };

        // Fastest path first: a cached reply needs no policy evaluation.
        if let Some(cached) = self.cache.get(&request).await {
            debug!(domain = %question.name(), "cache hit");
            return encode(&cached);
        }

        let domain = normalize(&question.name().to_string());

        if self.policy.is_blocked(&domain, client) {
            if self.log_blocks {
                info!(domain = %domain, client = ?client, "blocked");
            }
            return encode(&nxdomain_reply(&request));
        }

        if let Some(ip) = self.policy.lookup_override(&domain, client) {
            if self.log_overrides {
                info!(domain = %domain, answer = %ip, client = ?client, "override");
            }
            return encode(&override_reply(&request, ip));
        }

        if self.forwarder.upstream_count() == 0 {
            return encode(&servfail_reply(&request));
        }

        let reply = match QueryKey::from_message(&request) {
            Some(key) => self.resolve_coalesced(&request, &key, &domain).await,
            // No fingerprint to coalesce on; forward directly.
            None => self.forward_uncoalesced(&request).await,
        };
        encode(&reply)
    }

    async fn resolve_coalesced(&self, request: &Message, key: &QueryKey, domain: &str) -> Message {
        match self.coalescer.begin(key) {
            FlightRole::Leader => self.lead_fetch(request, key, domain).await,
            FlightRole::Follower(rx) => self.await_leader(request, rx).await,
        }
    }

    /// First arrival for the fingerprint: fetch upstream, cache the
    /// outcome, and broadcast it to every coalesced waiter.
    async fn lead_fetch(&self, request: &Message, key: &QueryKey, domain: &str) -> Message {
        // The cache may have been filled between the miss and winning the
        // flight; publish that entry rather than refetching.
        if let Some(cached) = self.cache.get(request).await {
            self.coalescer.publish(key, &cached);
            return cached;
        }

        let outcome = match self.forwarder.forward(request).await {
            Some(resp) => resp,
            None => {
                debug!(domain = %domain, "all upstreams failed, answering NXDOMAIN");
                nxdomain_reply(request)
            }
        };

        self.cache.put(request, &outcome).await;
        self.coalescer.publish(key, &outcome);
        restamp(&outcome, request)
    }

    /// Later arrival: wait for the leader's broadcast, falling back to the
    /// cache and then a synthesized NXDOMAIN on timeout.
    async fn await_leader(&self, request: &Message, rx: oneshot::Receiver<Message>) -> Message {
        match tokio::time::timeout(FOLLOWER_TIMEOUT, rx).await {
            Ok(Ok(resp)) => restamp(&resp, request),
            // The leader aborted; nothing to serve.
            Ok(Err(_)) => servfail_reply(request),
            Err(_) => {
                if let Some(cached) = self.cache.get(request).await {
                    return cached;
                }
                let resp = nxdomain_reply(request);
                self.cache.put_if_absent(request, &resp).await;
                resp
            }
        }
    }

    async fn forward_uncoalesced(&self, request: &Message) -> Message {
        match self.forwarder.forward(request).await {
            Some(resp) => {
                self.cache.put(request, &resp).await;
                restamp(&resp, request)
            }
            None => {
                let resp = nxdomain_reply(request);
                self.cache.put(request, &resp).await;
                resp
            }
        }
    }

    /// The response cache, exposed for diagnostics.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }
}

fn encode(msg: &Message) -> Option<Vec<u8>> {
    match msg.to_vec() {
        Ok(wire) => Some(wire),
        Err(e) => {
            error!(error = %e, "failed to encode reply");
            None
        }
    }
}
