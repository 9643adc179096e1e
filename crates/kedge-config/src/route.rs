//! Routing rules: HTTP routes, gRPC routes and ad-hoc forward-proxy rules.
//!
//! All rule lists are evaluated in configured order and the first match
//! wins, so the order in the file is significant.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a request reached the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Matches requests in either mode.
    #[default]
    Any,
    /// The client addressed a virtual-host name served by the gateway.
    ReverseProxy,
    /// The client used the gateway as an HTTP (or CONNECT) proxy.
    ForwardProxy,
}

impl ProxyMode {
    /// Whether a rule configured with `self` accepts a request observed in `observed`.
    pub fn accepts(self, observed: ProxyMode) -> bool {
        self == ProxyMode::Any || self == observed
    }
}

/// Maps HTTP request attributes to a backend name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    pub backend_name: String,
    /// Glob patterns over the request path. Empty means `/*`.
    #[serde(default)]
    pub path_rules: Vec<String>,
    /// Exact host (case-insensitive). Empty skips the check.
    #[serde(default)]
    pub host_matcher: String,
    /// Headers that must all be present with exactly these values.
    #[serde(default)]
    pub header_matcher: HashMap<String, String>,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
}

/// Maps gRPC call attributes to a backend name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcRoute {
    pub backend_name: String,
    /// Glob over the fully-qualified service name. Empty means `*`.
    #[serde(default)]
    pub service_name_matcher: String,
    /// Exact `:authority` (case-insensitive). Empty skips the check.
    #[serde(default)]
    pub authority_matcher: String,
    /// Metadata entries that must all be present with exactly these values.
    #[serde(default)]
    pub metadata_matcher: HashMap<String, String>,
}

/// Allows forward-proxy traffic to reach matching internal hosts directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocRule {
    /// Exact hostname, or `*.suffix` to match any host ending in `.suffix`.
    /// Empty never matches.
    pub dns_name_matcher: String,
    #[serde(default)]
    pub port: AdhocPort,
}

/// Port policy of an ad-hoc rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdhocPort {
    /// Port used when the request names none. Zero means 80.
    #[serde(default)]
    pub default: u16,
    #[serde(default)]
    pub allowed: Vec<u16>,
    #[serde(default)]
    pub allowed_ranges: Vec<PortRange>,
}

impl AdhocPort {
    /// Whether `port` is listed explicitly or falls in an allowed range.
    pub fn allows(&self, port: u16) -> bool {
        self.allowed.contains(&port) || self.allowed_ranges.iter().any(|r| r.contains(port))
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}
