//! Shared HTTP client for DoH exchanges and block-list downloads
//!
//! One client serves both concerns. When the system resolver cannot resolve
//! hostnames at startup — typically because this server is itself the
//! system resolver — the client is built with a resolver that queries the
//! configured fallback DNS server directly.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use reqwest::dns::{Addrs, Name as HostName, Resolve, Resolving};
use tokio::net::UdpSocket;
use tracing::info;

use crate::error::{Error, Result};

/// Overall client timeout, sized for block-list downloads; DoH queries set
/// a tighter per-request timeout.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for one bootstrap lookup against the fallback server.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the process-wide HTTP client.
///
/// `needs_bootstrap` is set when some configured source (a list URL or an
/// upstream hostname) will require name resolution; only then is the system
/// resolver probed and, if broken, replaced with the fallback path.
pub fn build_http_client(fallback_dns: IpAddr, needs_bootstrap: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(CLIENT_TIMEOUT);

    if needs_bootstrap && !system_dns_working() {
        info!(server = %fallback_dns, "system DNS not working, using fallback DNS server");
        builder = builder.dns_resolver(Arc::new(FallbackResolver::new(fallback_dns)));
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))
}

/// Probe whether the platform resolver can resolve a well-known name.
fn system_dns_working() -> bool {
    "dns.google:443"
        .to_socket_addrs()
        .map(|mut addrs| addrs.next().is_some())
        .unwrap_or(false)
}

/// `reqwest` resolver that queries a fixed DNS server over UDP instead of
/// the platform resolver.
struct FallbackResolver {
    server: SocketAddr,
}

impl FallbackResolver {
    fn new(server: IpAddr) -> Self {
        Self {
            server: SocketAddr::new(server, 53),
        }
    }

    async fn lookup(server: SocketAddr, host: String) -> Result<Vec<IpAddr>> {
        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.set_recursion_desired(true);
        let name = Name::from_utf8(format!("{}.", host))
            .map_err(|e| Error::Dns(format!("invalid hostname '{}': {}", host, e)))?;
        query.add_query(Query::query(name, RecordType::A));
        let wire = query
            .to_vec()
            .map_err(|e| Error::Dns(format!("failed to encode bootstrap query: {}", e)))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&wire, server).await?;
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(LOOKUP_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::Dns("bootstrap DNS lookup timed out".into()))??;
        buf.truncate(len);

        let resp = Message::from_vec(&buf)
            .map_err(|e| Error::Dns(format!("failed to decode bootstrap response: {}", e)))?;
        if resp.response_code() != ResponseCode::NoError {
            return Err(Error::Dns(format!(
                "bootstrap DNS lookup for '{}' failed with {}",
                host,
                resp.response_code()
            )));
        }

        let ips: Vec<IpAddr> = resp
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect();
        if ips.is_empty() {
            return Err(Error::Dns(format!("no addresses for '{}'", host)));
        }
        Ok(ips)
    }
}

impl Resolve for FallbackResolver {
    fn resolve(&self, name: HostName) -> Resolving {
        let server = self.server;
        let host = name.as_str().to_string();
        Box::pin(async move {
            let ips = FallbackResolver::lookup(server, host).await?;
            // The port is filled in by the caller.
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
