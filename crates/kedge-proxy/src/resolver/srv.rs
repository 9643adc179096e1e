use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use super::{Resolver, Target, dedup_targets};
use crate::error::{ResolveError, ResolveResult};

/// SRV lookup; each record's target host is resolved to its addresses.
///
/// Freshness comes from the DNS answers themselves, so SRV-driven backends
/// refresh as often as their records' TTLs ask for.
pub struct SrvResolver {
    dns_name: String,
    resolver: TokioAsyncResolver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvRecord {
    priority: u16,
    weight: u16,
    host: String,
    port: u16,
}

impl SrvResolver {
    /// Use the host's `/etc/resolv.conf` settings.
    pub fn from_system_conf(dns_name: &str) -> ResolveResult<Self> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|source| ResolveError::Dns {
                name: dns_name.to_string(),
                source,
            })?;
        Ok(Self::with_resolver(dns_name, resolver))
    }

    pub fn with_resolver(dns_name: &str, resolver: TokioAsyncResolver) -> Self {
        Self {
            dns_name: dns_name.to_string(),
            resolver,
        }
    }
}

#[async_trait]
impl Resolver for SrvResolver {
    async fn resolve(&self) -> ResolveResult<Vec<Target>> {
        let lookup = self
            .resolver
            .srv_lookup(self.dns_name.as_str())
            .await
            .map_err(|source| ResolveError::Dns {
                name: self.dns_name.clone(),
                source,
            })?;
        let srv_deadline = lookup.as_lookup().valid_until();

        let mut records: Vec<SrvRecord> = lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                host: srv.target().to_utf8(),
                port: srv.port(),
            })
            .collect();
        order_records(&mut records);

        let mut answers = Vec::with_capacity(records.len());
        for record in records {
            let answer = self
                .resolver
                .lookup_ip(record.host.as_str())
                .await
                .map(|ips| (ips.iter().collect(), ips.valid_until()))
                .map_err(|source| ResolveError::Dns {
                    name: record.host.clone(),
                    source,
                });
            answers.push((record, answer));
        }

        assemble_targets(&self.dns_name, srv_deadline, answers)
    }
}

type HostAnswer = ResolveResult<(Vec<IpAddr>, Instant)>;

/// Targets from the per-record host lookups, in record order.
///
/// A failed host lookup is skipped as long as another record produced
/// targets. If every lookup failed, the first failure is returned so the
/// pool keeps its previous targets.
fn assemble_targets(
    dns_name: &str,
    srv_deadline: Instant,
    answers: Vec<(SrvRecord, HostAnswer)>,
) -> ResolveResult<Vec<Target>> {
    let records = answers.len();
    let mut targets = Vec::new();
    let mut first_error = None;

    for (record, answer) in answers {
        match answer {
            Ok((ips, valid_until)) => {
                let deadline = srv_deadline.min(valid_until);
                targets.extend(ips.into_iter().map(|ip| {
                    Target::new(SocketAddr::new(ip, record.port).to_string(), deadline)
                }));
            }
            Err(e) => {
                warn!(%dns_name, host = %record.host, error = %e, "srv target lookup failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if targets.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    debug!(%dns_name, records, targets = targets.len(), "srv lookup complete");
    Ok(dedup_targets(targets))
}

/// Lowest priority first; heavier weights first within a priority.
fn order_records(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.weight.cmp(&a.weight))
    });
}
