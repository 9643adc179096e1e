use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{Resolver, Target, dedup_targets};
use crate::error::{ResolveError, ResolveResult};

/// A/AAAA lookup through the system resolver; one target per address.
pub struct DnsResolver {
    hostname: String,
    port: u16,
    ttl: Duration,
}

impl DnsResolver {
    pub fn new(hostname: &str, port: u16, ttl: Duration) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            ttl,
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self) -> ResolveResult<Vec<Target>> {
        let addrs = tokio::net::lookup_host((self.hostname.as_str(), self.port))
            .await
            .map_err(|source| ResolveError::Lookup {
                name: self.hostname.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.ttl;
        let targets: Vec<Target> = addrs
            .map(|addr: SocketAddr| Target::new(addr.to_string(), deadline))
            .collect();

        debug!(hostname = %self.hostname, count = targets.len(), "dns lookup complete");
        Ok(dedup_targets(targets))
    }
}
