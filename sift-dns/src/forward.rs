//! Upstream forwarding over UDP, TCP, DoT, and DoH
//!
//! Endpoints are tried in round-robin order with failover: a shared atomic
//! counter picks the starting endpoint and each query walks the list until
//! one returns a validated response. Truncated UDP answers are retried over
//! TCP against the same endpoint before it counts as failed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::config::{Protocol, UpstreamSpec};
use crate::error::{Error, Result};
use crate::message::response_matches;

/// Per-attempt timeout for upstream exchanges.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP response size accepted from an upstream.
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum response size over stream transports.
const MAX_STREAM_RESPONSE_SIZE: usize = 65_535;

/// Multi-protocol upstream client shared by all handler tasks.
pub struct Forwarder {
    upstreams: Vec<UpstreamSpec>,
    next_upstream: AtomicU64,
    http: reqwest::Client,
    tls: Arc<rustls::ClientConfig>,
}

impl Forwarder {
    pub fn new(upstreams: Vec<UpstreamSpec>, http: reqwest::Client) -> Result<Self> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("failed to create TLS config: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            upstreams,
            next_upstream: AtomicU64::new(0),
            http,
            tls: Arc::new(tls),
        })
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// Forward a query, trying upstreams in round-robin order until one
    /// yields a valid response. Returns `None` once every upstream failed.
    pub async fn forward(&self, request: &Message) -> Option<Message> {
        if self.upstreams.is_empty() {
            debug!("no upstreams configured");
            return None;
        }
        let wire = match request.to_vec() {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "failed to encode query");
                return None;
            }
        };

        let count = self.upstreams.len() as u64;
        let start = (self.next_upstream.fetch_add(1, Ordering::Relaxed) % count) as usize;

        for offset in 0..self.upstreams.len() {
            let upstream = &self.upstreams[(start + offset) % self.upstreams.len()];
            if let Some(resp) = self.try_upstream(upstream, request, &wire).await {
                return Some(resp);
            }
        }

        debug!("all upstreams failed");
        None
    }

    async fn try_upstream(
        &self,
        upstream: &UpstreamSpec,
        request: &Message,
        wire: &[u8],
    ) -> Option<Message> {
        let resp = match self.exchange(upstream, wire).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(upstream = %upstream, error = %e, "upstream exchange failed");
                return None;
            }
        };

        if !response_matches(request, &resp) {
            debug!(upstream = %upstream, "response does not match query, trying next upstream");
            return None;
        }

        // A truncated datagram answer is retried over TCP against the same
        // endpoint, counting as part of this endpoint's attempt.
        if resp.truncated() && !upstream.protocol.is_stream() {
            return self.retry_truncated_over_tcp(upstream, request, wire).await;
        }

        Some(resp)
    }

    async fn retry_truncated_over_tcp(
        &self,
        upstream: &UpstreamSpec,
        request: &Message,
        wire: &[u8],
    ) -> Option<Message> {
        debug!(upstream = %upstream, "truncated UDP response, retrying over TCP");
        match self.exchange_tcp(upstream, wire).await {
            Ok(resp) if response_matches(request, &resp) => Some(resp),
            Ok(_) => {
                debug!(upstream = %upstream, "TCP retry response does not match query");
                None
            }
            Err(e) => {
                debug!(upstream = %upstream, error = %e, "TCP retry failed");
                None
            }
        }
    }

    async fn exchange(&self, upstream: &UpstreamSpec, wire: &[u8]) -> Result<Message> {
        match upstream.protocol {
            Protocol::Udp => self.exchange_udp(upstream, wire).await,
            Protocol::Tcp => self.exchange_tcp(upstream, wire).await,
            Protocol::Dot => self.exchange_dot(upstream, wire).await,
            Protocol::Doh => self.exchange_doh(upstream, wire).await,
        }
    }

    async fn exchange_udp(&self, upstream: &UpstreamSpec, wire: &[u8]) -> Result<Message> {
        let addr = resolve_endpoint(upstream).await?;
        let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(wire, addr).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let (len, from) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Dns("UDP exchange timed out".into()))??;
        if from != addr {
            return Err(Error::Dns(format!(
                "UDP response from unexpected source {}",
                from
            )));
        }
        buf.truncate(len);
        decode(&buf)
    }

    async fn exchange_tcp(&self, upstream: &UpstreamSpec, wire: &[u8]) -> Result<Message> {
        let addr = resolve_endpoint(upstream).await?;
        let mut stream = tokio::time::timeout(UPSTREAM_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Dns("TCP connect timed out".into()))??;
        let buf = exchange_over_stream(&mut stream, wire).await?;
        decode(&buf)
    }

    async fn exchange_dot(&self, upstream: &UpstreamSpec, wire: &[u8]) -> Result<Message> {
        let addr = resolve_endpoint(upstream).await?;
        let tcp = tokio::time::timeout(UPSTREAM_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Dns("DoT connect timed out".into()))??;

        let connector = tokio_rustls::TlsConnector::from(self.tls.clone());
        let server_name = rustls_pki_types::ServerName::try_from(upstream.address.clone())
            .map_err(|e| {
                Error::Dns(format!(
                    "invalid DoT server name '{}': {}",
                    upstream.address, e
                ))
            })?;
        let mut stream = tokio::time::timeout(UPSTREAM_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Dns("DoT handshake timed out".into()))??;
        let buf = exchange_over_stream(&mut stream, wire).await?;
        decode(&buf)
    }

    async fn exchange_doh(&self, upstream: &UpstreamSpec, wire: &[u8]) -> Result<Message> {
        let url = doh_endpoint_url(&upstream.address);

        // POST first; on transport error or a non-success status fall back
        // to GET with the query carried in the `dns` parameter.
        let post = self
            .http
            .post(&url)
            .header("Accept", "application/dns-message")
            .header("Content-Type", "application/dns-message")
            .body(wire.to_vec())
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await;

        let resp = match post {
            Ok(resp) if resp.status().is_success() => resp,
            _ => {
                let encoded = URL_SAFE_NO_PAD.encode(wire);
                let resp = self
                    .http
                    .get(&url)
                    .query(&[("dns", encoded.as_str())])
                    .header("Accept", "application/dns-message")
                    .timeout(UPSTREAM_TIMEOUT)
                    .send()
                    .await
                    .map_err(|e| Error::Dns(format!("DoH request failed: {}", e)))?;
                if !resp.status().is_success() {
                    return Err(Error::Dns(format!(
                        "DoH server returned {}",
                        resp.status()
                    )));
                }
                resp
            }
        };

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Dns(format!("failed to read DoH response: {}", e)))?;
        decode(&body)
    }
}

/// HTTPS endpoint for a DoH upstream address. Full URLs pass through;
/// well-known public resolver IPs map to their published endpoints;
/// anything else gets the conventional `/dns-query` path.
pub(crate) fn doh_endpoint_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    match address {
        "1.1.1.1" | "1.0.0.1" => "https://cloudflare-dns.com/dns-query".to_string(),
        "8.8.8.8" | "8.8.4.4" => "https://dns.google/dns-query".to_string(),
        _ => format!("https://{}/dns-query", address),
    }
}

async fn resolve_endpoint(upstream: &UpstreamSpec) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((upstream.address.as_str(), upstream.port))
        .await
        .map_err(|e| {
            Error::Dns(format!(
                "failed to resolve upstream {}: {}",
                upstream.address, e
            ))
        })?;
    addrs.next().ok_or_else(|| {
        Error::Dns(format!("no addresses for upstream {}", upstream.address))
    })
}

/// Length-prefixed DNS exchange over an established stream transport.
async fn exchange_over_stream<S>(stream: &mut S, wire: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(wire);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| Error::Dns("stream read timed out".into()))??;

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_STREAM_RESPONSE_SIZE {
        return Err(Error::Dns("DNS response too large".into()));
    }
    let mut buf = vec![0u8; len];
    tokio::time::timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| Error::Dns("stream read timed out".into()))??;
    Ok(buf)
}

fn decode(buf: &[u8]) -> Result<Message> {
    Message::from_vec(buf)
        .map_err(|e| Error::Dns(format!("failed to decode upstream response: {}", e)))
}
