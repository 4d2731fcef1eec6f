//! sift-dns - a filtering DNS forwarder
//!
//! Answers client queries from, in priority order: an in-memory response
//! cache, a per-client deny list (NXDOMAIN), a per-client override map
//! (synthesized A records), or one of the configured upstream nameservers
//! reached over UDP, TCP, DoT, or DoH. Concurrent identical queries are
//! collapsed into a single upstream exchange whose result is shared by all
//! waiters.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sift_dns::{Config, DnsServer, Resolver};
//!
//! # async fn example() -> sift_dns::Result<()> {
//! let config = Config::from_toml(r#"
//! listen = "127.0.0.1:5353"
//! nameservers = ["9.9.9.9", { address = "1.1.1.1", protocol = "dot" }]
//! "#)?;
//!
//! let (shutdown, _) = tokio::sync::broadcast::channel(1);
//! let resolver = Resolver::new(&config, &shutdown).await?;
//! DnsServer::new(config.listen, Arc::new(resolver), shutdown).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod blocklist;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod forward;
pub mod http;
pub mod message;
pub mod name;
pub mod policy;
pub mod resolver;
pub mod server;

pub use cache::{QueryKey, ResponseCache};
pub use coalesce::{Coalescer, FlightRole};
pub use config::{BlockListSource, Config, Protocol, UpstreamSpec};
pub use error::{Error, Result};
pub use forward::Forwarder;
pub use name::normalize;
pub use policy::{ClientRule, OverrideEntry, PolicyStore};
pub use resolver::Resolver;
pub use server::DnsServer;
