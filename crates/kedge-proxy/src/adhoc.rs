//! Ad-hoc addressing for forward-proxy traffic.
//!
//! When no named route matches a forward-proxy request, the addresser may
//! still let it through to the host the client asked for, provided the
//! host matches a configured DNS pattern and the port is allow-listed.
//! The destination is dialed directly; it never goes through the pool.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use http::Request;
use tracing::debug;

use kedge_config::AdhocRule;

use crate::error::{AdhocError, AdhocResult};
use crate::router::request_authority;

const FALLBACK_PORT: u16 = 80;

pub type LookupFuture = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send>>;

/// Hostname to IP address lookup used by the addresser.
pub type LookupFn = Arc<dyn Fn(String) -> LookupFuture + Send + Sync>;

/// Lookup through the operating system resolver.
pub fn system_lookup() -> LookupFn {
    Arc::new(|host: String| -> LookupFuture {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), 0)).await?;
            Ok::<_, io::Error>(addrs.map(|a| a.ip()).collect::<Vec<_>>())
        })
    })
}

pub struct AdhocAddresser {
    rules: Vec<AdhocRule>,
    lookup: LookupFn,
}

impl AdhocAddresser {
    pub fn new(rules: Vec<AdhocRule>) -> Self {
        Self::with_lookup(rules, system_lookup())
    }

    pub fn with_lookup(rules: Vec<AdhocRule>, lookup: LookupFn) -> Self {
        Self { rules, lookup }
    }

    /// Dial address for the request's target host.
    ///
    /// The request is only read up front, so the returned future does not
    /// borrow it.
    pub fn address<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = AdhocResult<String>> + Send + use<'_, B> {
        let authority = request_authority(req).to_string();
        async move { self.address_for(&authority).await }
    }

    /// Dial address for a `host[:port]` authority.
    pub async fn address_for(&self, authority: &str) -> AdhocResult<String> {
        let (host, port) = split_host_port(authority)?;

        let rule = self
            .rules
            .iter()
            .find(|r| dns_name_matches(&r.dns_name_matcher, host))
            .ok_or(AdhocError::RouteNotFound)?;

        let port = match port {
            Some(p) => p,
            None if rule.port.default != 0 => rule.port.default,
            None => FALLBACK_PORT,
        };
        if !rule.port.allows(port) {
            return Err(AdhocError::PortNotAllowed(port));
        }

        // Resolved address is used on lookup success. Lookup failure is a
        // gateway error, never a fallthrough to the next rule.
        let ip = self.resolve(host).await?;
        let address = SocketAddr::new(ip, port).to_string();
        debug!(host, %address, matcher = %rule.dns_name_matcher, "adhoc destination");
        Ok(address)
    }

    async fn resolve(&self, host: &str) -> AdhocResult<IpAddr> {
        let failed = |reason: String| AdhocError::ResolutionFailed {
            host: host.to_string(),
            reason,
        };
        let ips = (self.lookup)(host.to_string())
            .await
            .map_err(|e| failed(e.to_string()))?;
        ips.into_iter()
            .next()
            .ok_or_else(|| failed("no addresses".to_string()))
    }
}

/// Split `host[:port]`. A port of `0` counts as absent. Userinfo and an
/// empty host are refused.
fn split_host_port(authority: &str) -> AdhocResult<(&str, Option<u16>)> {
    if authority.is_empty() || authority.contains('@') {
        return Err(AdhocError::InvalidAuthority(authority.to_string()));
    }
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port
        match rest.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, tail)) => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(AdhocError::MalformedPort(tail.to_string())),
            },
            None => return Err(AdhocError::MalformedPort(authority.to_string())),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(AdhocError::InvalidAuthority(authority.to_string()));
    }
    let port = match port {
        None => None,
        Some(text) => match text.parse::<u16>() {
            Ok(0) => None,
            Ok(p) => Some(p),
            Err(_) => return Err(AdhocError::MalformedPort(text.to_string())),
        },
    };
    Ok((host, port))
}

/// Exact match, or `*.suffix` matching any host that ends in `.suffix`.
/// An empty matcher never matches.
fn dns_name_matches(matcher: &str, host: &str) -> bool {
    if matcher.is_empty() {
        return false;
    }
    match matcher.strip_prefix('*') {
        Some(suffix) => {
            host.len() > suffix.len()
                && suffix.starts_with('.')
                && host
                    .get(host.len() - suffix.len()..)
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
        }
        None => host.eq_ignore_ascii_case(matcher),
    }
}
