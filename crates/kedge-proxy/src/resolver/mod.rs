//! Target discovery.
//!
//! A [`Resolver`] turns one backend's discovery settings into the current
//! list of dial targets. Every call returns a complete snapshot; working out
//! what changed is the pool's job.

mod dns;
mod kubernetes;
mod srv;
mod static_list;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use kedge_config::{BackendConfig, ResolverConfig};

use crate::error::ResolveResult;

pub use dns::DnsResolver;
pub use kubernetes::KubernetesResolver;
pub use srv::SrvResolver;
pub use static_list::StaticResolver;

/// One dialable address and how long it stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host:port` to dial.
    pub address: String,
    /// After this instant the target should be re-resolved.
    pub deadline: Instant,
}

impl Target {
    pub fn new(address: impl Into<String>, deadline: Instant) -> Self {
        Self {
            address: address.into(),
            deadline,
        }
    }
}

/// Produces the current target list for one backend.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self) -> ResolveResult<Vec<Target>>;
}

/// Build the resolver described by a backend's configuration.
pub fn from_config(backend: &BackendConfig) -> ResolveResult<Arc<dyn Resolver>> {
    let resolver: Arc<dyn Resolver> = match &backend.resolver {
        ResolverConfig::Static { addresses, ttl } => {
            Arc::new(StaticResolver::new(addresses.clone(), *ttl))
        }
        ResolverConfig::Dns {
            hostname,
            port,
            ttl,
        } => Arc::new(DnsResolver::new(hostname, *port, *ttl)),
        ResolverConfig::Srv { dns_name } => Arc::new(SrvResolver::from_system_conf(dns_name)?),
        ResolverConfig::Kubernetes {
            namespace,
            service,
            port_name,
            api_url,
            poll_interval,
        } => Arc::new(KubernetesResolver::new(
            api_url,
            namespace,
            service,
            port_name,
            *poll_interval,
        )?),
    };
    Ok(resolver)
}

/// Drop repeated addresses, keeping the first occurrence.
pub(crate) fn dedup_targets(targets: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(t.address.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn dedup_keeps_first_seen_order() {
        let now = Instant::now();
        let targets = vec![
            Target::new("10.0.0.2:80", now),
            Target::new("10.0.0.1:80", now),
            Target::new("10.0.0.2:80", now + Duration::from_secs(5)),
        ];

        let deduped = dedup_targets(targets);
        let addresses: Vec<&str> = deduped.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.2:80", "10.0.0.1:80"]);
        assert_eq!(deduped[0].deadline, now);
    }

    #[tokio::test]
    async fn from_config_builds_static_resolver() {
        let backend: BackendConfig = toml::from_str(
            r#"
name = "api"
[resolver]
kind = "static"
addresses = ["127.0.0.1:8080", "127.0.0.1:8081"]
"#,
        )
        .unwrap();

        let resolver = from_config(&backend).unwrap();
        let targets = resolver.resolve().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].address, "127.0.0.1:8081");
    }
}
