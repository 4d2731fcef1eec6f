//! Resolver configuration
//!
//! Loaded from a TOML file. Nameserver, override, and block-list entries
//! each accept either a bare string or a table form; the table forms carry
//! protocol/port details or per-client restrictions.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::name::normalize;
use crate::policy::{ClientRule, OverrideEntry};

/// Upstream transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Dot,
    Doh,
}

impl Protocol {
    /// Default port for this protocol.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::Dot => 853,
            Protocol::Doh => 443,
        }
    }

    /// Stream transports carry full-size messages and never need a
    /// truncation retry.
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Dot | Protocol::Doh)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Dot => write!(f, "dot"),
            Protocol::Doh => write!(f, "doh"),
        }
    }
}

/// A configured upstream nameserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    /// IP address, hostname, or (for DoH) a full URL.
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl fmt::Display for UpstreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, self.protocol)
    }
}

/// A block-list source with its parsed client restriction.
#[derive(Debug, Clone)]
pub struct BlockListSource {
    /// Local file path or `http(s)://` URL.
    pub source: String,
    /// Applied to every domain loaded from this list.
    pub rule: ClientRule,
}

impl BlockListSource {
    pub fn is_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NameserverEntry {
    /// `"9.9.9.9"` or `"9.9.9.9:5353"` — UDP upstream.
    Plain(String),
    /// `{ address = "1.1.1.1", protocol = "dot", port = 853 }`.
    Detailed {
        address: String,
        #[serde(default)]
        protocol: Protocol,
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OverrideEntryRaw {
    /// `"svc.local" = "127.0.0.1"` — answer for all clients.
    Plain(String),
    /// Table form: the first `ips` element is the answer; `ips` and
    /// `subnets` together restrict which clients the override applies to.
    Detailed {
        ips: Vec<String>,
        #[serde(default)]
        subnets: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BlockListEntryRaw {
    /// Bare path or URL, unrestricted.
    Plain(String),
    /// Table form with per-client restrictions.
    Restricted {
        #[serde(alias = "file", alias = "url")]
        source: String,
        #[serde(default)]
        ips: Vec<String>,
        #[serde(default)]
        subnets: Vec<String>,
    },
}

/// Resolver configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the UDP and TCP listeners bind to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Upstream nameservers, tried in round-robin order.
    #[serde(default = "default_nameservers")]
    nameservers: Vec<NameserverEntry>,

    /// Domain→address overrides, answered before any upstream is consulted.
    #[serde(default)]
    overrides: HashMap<String, OverrideEntryRaw>,

    /// Block-list files and URLs.
    #[serde(default)]
    block_lists: Vec<BlockListEntryRaw>,

    /// Positive cache TTL ceiling in seconds; 0 disables positive caching.
    #[serde(default = "default_positive_ttl")]
    pub positive_ttl: u64,

    /// Negative cache TTL ceiling in seconds; 0 disables negative caching.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,

    /// Maximum cache entries; 0 means unbounded.
    #[serde(default)]
    pub max_cache_entries: usize,

    /// Minutes between re-downloads of URL-backed block lists; 0 disables.
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,

    /// DNS server used to bootstrap hostname resolution when the system
    /// resolver is unusable at startup.
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: IpAddr,

    /// Raise the default log filter to `debug`.
    #[serde(default)]
    pub debug: bool,

    /// Log every blocked query.
    #[serde(default)]
    pub log_blocks: bool,

    /// Log every override answer.
    #[serde(default)]
    pub log_overrides: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            nameservers: default_nameservers(),
            overrides: HashMap::new(),
            block_lists: Vec::new(),
            positive_ttl: default_positive_ttl(),
            negative_ttl: default_negative_ttl(),
            max_cache_entries: 0,
            reload_interval: default_reload_interval(),
            fallback_dns: default_fallback_dns(),
            debug: false,
            log_blocks: false,
            log_overrides: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Override entries without an answer
    /// address and malformed predicates refuse startup here rather than
    /// misbehaving at query time.
    pub fn validate(&self) -> Result<()> {
        self.upstreams()?;
        self.override_entries()?;
        self.block_list_sources()?;
        Ok(())
    }

    /// Parsed upstream list with protocol-default ports filled in.
    pub fn upstreams(&self) -> Result<Vec<UpstreamSpec>> {
        self.nameservers
            .iter()
            .map(|entry| match entry {
                NameserverEntry::Plain(s) => {
                    let s = s.trim();
                    if s.is_empty() {
                        return Err(Error::Config("empty nameserver address".into()));
                    }
                    let (address, port) = split_host_port(s);
                    Ok(UpstreamSpec {
                        address,
                        protocol: Protocol::Udp,
                        port: port.unwrap_or(53),
                    })
                }
                NameserverEntry::Detailed {
                    address,
                    protocol,
                    port,
                } => {
                    if address.trim().is_empty() {
                        return Err(Error::Config("empty nameserver address".into()));
                    }
                    Ok(UpstreamSpec {
                        address: address.trim().to_string(),
                        protocol: *protocol,
                        port: port.unwrap_or_else(|| protocol.default_port()),
                    })
                }
            })
            .collect()
    }

    /// Parsed override map keyed by normalized domain.
    pub fn override_entries(&self) -> Result<HashMap<String, OverrideEntry>> {
        let mut result = HashMap::new();
        for (domain, raw) in &self.overrides {
            let entry = match raw {
                OverrideEntryRaw::Plain(ip) => OverrideEntry {
                    answer: parse_answer_ip(ip, domain)?,
                    clients: ClientRule::default(),
                },
                OverrideEntryRaw::Detailed { ips, subnets } => {
                    let first = ips.first().ok_or_else(|| {
                        Error::Config(format!(
                            "override '{}' needs at least one IP in 'ips'",
                            domain
                        ))
                    })?;
                    OverrideEntry {
                        answer: parse_answer_ip(first, domain)?,
                        clients: parse_client_rule(ips, subnets)?,
                    }
                }
            };
            result.insert(normalize(domain), entry);
        }
        Ok(result)
    }

    /// Parsed block-list sources with their client restrictions.
    pub fn block_list_sources(&self) -> Result<Vec<BlockListSource>> {
        self.block_lists
            .iter()
            .map(|entry| match entry {
                BlockListEntryRaw::Plain(source) => Ok(BlockListSource {
                    source: source.clone(),
                    rule: ClientRule::default(),
                }),
                BlockListEntryRaw::Restricted {
                    source,
                    ips,
                    subnets,
                } => Ok(BlockListSource {
                    source: source.clone(),
                    rule: parse_client_rule(ips, subnets)?,
                }),
            })
            .collect()
    }

    /// Generate a sample configuration.
    pub fn sample() -> String {
        r#"# Sift DNS forwarder configuration

# Address the UDP and TCP listeners bind to.
listen = "0.0.0.0:53"

# Upstream nameservers, tried in round-robin order with failover.
# Entries are either a bare address (UDP, port 53 unless given) or a table
# selecting a protocol: "udp", "tcp", "dot" (port 853), "doh" (port 443).
nameservers = [
    "9.9.9.9",
    { address = "1.1.1.1", protocol = "dot" },
    { address = "https://dns.google/dns-query", protocol = "doh" },
]

# Positive cache TTL ceiling in seconds (0 disables positive caching).
positive_ttl = 60

# Negative cache TTL ceiling in seconds (0 disables negative caching).
negative_ttl = 300

# Maximum cache entries (0 = unbounded).
max_cache_entries = 10000

# Minutes between re-downloads of URL-backed block lists (0 disables).
reload_interval = 60

# DNS server used to resolve hostnames when the system resolver is broken
# at startup, e.g. because this server is the system resolver.
fallback_dns = "8.8.8.8"

# Raise the default log filter to debug.
debug = false

# Log blocked queries and override answers.
log_blocks = false
log_overrides = false

# Block lists: hosts/adblock-style files or URLs. A table entry restricts
# the whole list to specific client IPs or subnets.
block_lists = [
    # "/etc/sift/ads.txt",
    # { source = "https://example.com/hosts.txt", subnets = ["10.0.0.0/8"] },
]

# Domain overrides, answered with a synthesized A record (TTL 300).
# A bare address applies to all clients; in the table form the first
# element of `ips` is the answer and `ips`/`subnets` restrict which
# clients see it.
[overrides]
# "svc.local" = "127.0.0.1"
# "printer.lan" = { ips = ["192.168.1.50"], subnets = ["192.168.0.0/16"] }
"#
        .to_string()
    }
}

fn parse_answer_ip(s: &str, domain: &str) -> Result<Ipv4Addr> {
    s.trim().parse().map_err(|_| {
        Error::Config(format!(
            "override '{}' has invalid answer address '{}' (IPv4 required)",
            domain, s
        ))
    })
}

fn parse_client_rule(ips: &[String], subnets: &[String]) -> Result<ClientRule> {
    let ips = ips
        .iter()
        .map(|s| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|_| Error::Config(format!("invalid IP address '{}'", s)))
        })
        .collect::<Result<Vec<_>>>()?;
    let subnets = subnets
        .iter()
        .map(|s| parse_subnet(s))
        .collect::<Result<Vec<_>>>()?;
    Ok(ClientRule { ips, subnets })
}

/// Parse a CIDR string; a bare address is treated as a host-length prefix.
fn parse_subnet(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if s.contains('/') {
        return s
            .parse()
            .map_err(|e| Error::Config(format!("invalid subnet '{}': {}", s, e)));
    }
    let ip: IpAddr = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid subnet '{}'", s)))?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, prefix).map_err(|e| Error::Config(format!("invalid subnet '{}': {}", s, e)))
}

/// Split a trailing `:port` from an address, leaving bracketed and bare
/// IPv6 literals intact.
fn split_host_port(s: &str) -> (String, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            if let Some(port) = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
            {
                return (host, Some(port));
            }
            return (host, None);
        }
    }
    if let Some(idx) = s.rfind(':') {
        // A second colon means an unbracketed IPv6 literal, not a port.
        if !s[..idx].contains(':') {
            if let Ok(port) = s[idx + 1..].parse() {
                return (s[..idx].to_string(), Some(port));
            }
        }
    }
    (s.to_string(), None)
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:53".parse().expect("valid default listen address")
}

fn default_nameservers() -> Vec<NameserverEntry> {
    vec![
        NameserverEntry::Plain("8.8.8.8".to_string()),
        NameserverEntry::Plain("8.8.4.4".to_string()),
    ]
}

fn default_positive_ttl() -> u64 {
    60
}

fn default_negative_ttl() -> u64 {
    300
}

fn default_reload_interval() -> u64 {
    60
}

fn default_fallback_dns() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listen, "0.0.0.0:53".parse().unwrap());
        assert_eq!(config.positive_ttl, 60);
        assert_eq!(config.negative_ttl, 300);
        assert_eq!(config.max_cache_entries, 0);
        assert_eq!(config.reload_interval, 60);
        assert!(!config.debug);

        let upstreams = config.upstreams().unwrap();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams[0].address, "8.8.8.8");
        assert_eq!(upstreams[0].protocol, Protocol::Udp);
        assert_eq!(upstreams[0].port, 53);
    }

    #[test]
    fn test_plain_nameserver_with_port() {
        let config = Config::from_toml(r#"nameservers = ["9.9.9.9:5353"]"#).unwrap();
        let upstreams = config.upstreams().unwrap();
        assert_eq!(
            upstreams[0],
            UpstreamSpec {
                address: "9.9.9.9".into(),
                protocol: Protocol::Udp,
                port: 5353,
            }
        );
    }

    #[test]
    fn test_ipv6_nameserver() {
        let config =
            Config::from_toml(r#"nameservers = ["[2001:4860:4860::8888]:5353", "2001:4860:4860::8844"]"#)
                .unwrap();
        let upstreams = config.upstreams().unwrap();
        assert_eq!(upstreams[0].address, "2001:4860:4860::8888");
        assert_eq!(upstreams[0].port, 5353);
        assert_eq!(upstreams[1].address, "2001:4860:4860::8844");
        assert_eq!(upstreams[1].port, 53);
    }

    #[test]
    fn test_detailed_nameserver_default_ports() {
        let config = Config::from_toml(
            r#"
nameservers = [
    { address = "1.1.1.1", protocol = "dot" },
    { address = "dns.google", protocol = "doh" },
    { address = "8.8.8.8", protocol = "tcp" },
    { address = "8.8.8.8", protocol = "dot", port = 8853 },
]
"#,
        )
        .unwrap();
        let upstreams = config.upstreams().unwrap();
        assert_eq!(upstreams[0].port, 853);
        assert_eq!(upstreams[1].port, 443);
        assert_eq!(upstreams[2].port, 53);
        assert_eq!(upstreams[3].port, 8853);
    }

    #[test]
    fn test_override_plain() {
        let config = Config::from_toml(
            r#"
[overrides]
"Svc.Local." = "127.0.0.1"
"#,
        )
        .unwrap();
        let overrides = config.override_entries().unwrap();
        let entry = overrides.get("svc.local").expect("normalized key");
        assert_eq!(entry.answer, Ipv4Addr::new(127, 0, 0, 1));
        assert!(entry.clients.is_unrestricted());
    }

    #[test]
    fn test_override_detailed() {
        let config = Config::from_toml(
            r#"
[overrides]
"printer.lan" = { ips = ["192.168.1.50", "10.0.0.9"], subnets = ["192.168.0.0/16"] }
"#,
        )
        .unwrap();
        let overrides = config.override_entries().unwrap();
        let entry = &overrides["printer.lan"];
        assert_eq!(entry.answer, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(entry.clients.ips.len(), 2);
        assert_eq!(entry.clients.subnets.len(), 1);
        assert!(entry.clients.matches(Some("192.168.7.7".parse().unwrap())));
        assert!(!entry.clients.matches(Some("172.16.0.1".parse().unwrap())));
    }

    #[test]
    fn test_override_without_ip_is_fatal() {
        let result = Config::from_toml(
            r#"
[overrides]
"svc.local" = { ips = [] }
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_override_invalid_answer_is_fatal() {
        let result = Config::from_toml(
            r#"
[overrides]
"svc.local" = "::1"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_block_list_entries() {
        let config = Config::from_toml(
            r#"
block_lists = [
    "/etc/sift/ads.txt",
    { source = "https://example.com/hosts.txt", subnets = ["10.0.0.0/8"] },
    { file = "/etc/sift/extra.txt", ips = ["192.168.1.50"] },
]
"#,
        )
        .unwrap();
        let sources = config.block_list_sources().unwrap();
        assert_eq!(sources.len(), 3);
        assert!(!sources[0].is_url());
        assert!(sources[0].rule.is_unrestricted());
        assert!(sources[1].is_url());
        assert_eq!(sources[1].rule.subnets.len(), 1);
        assert_eq!(sources[2].rule.ips.len(), 1);
    }

    #[test]
    fn test_subnet_without_prefix_is_host() {
        let net = parse_subnet("10.1.2.3").unwrap();
        assert!(net.contains(&"10.1.2.3".parse::<IpAddr>().unwrap()));
        assert!(!net.contains(&"10.1.2.4".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_invalid_subnet_is_fatal() {
        let result = Config::from_toml(
            r#"
block_lists = [{ source = "/tmp/x", subnets = ["not-a-subnet"] }]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        let upstreams = config.upstreams().unwrap();
        assert_eq!(upstreams.len(), 3);
        assert_eq!(upstreams[1].protocol, Protocol::Dot);
        assert_eq!(upstreams[2].protocol, Protocol::Doh);
    }
}
