//! Backend definitions: how a named backend is discovered, balanced and dialed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;

/// A named, load-balanced group of endpoints serving one logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique (per protocol) backend name; the router's match result.
    pub name: String,
    /// How the backend's targets are discovered.
    pub resolver: ResolverConfig,
    /// Load-balancing policy across live targets.
    #[serde(default)]
    pub balancer: Balancer,
    /// TLS settings. Presence means targets are dialed over TLS.
    #[serde(default)]
    pub security: Option<SecurityConfig>,
    /// Middleware chain applied around the transport call.
    #[serde(default)]
    pub middleware: Vec<MiddlewareConfig>,
}

impl BackendConfig {
    /// Whether targets of this backend are dialed over TLS.
    pub fn is_secure(&self) -> bool {
        self.security.is_some()
    }
}

/// Target discovery for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// Fixed list of `host:port` addresses.
    Static {
        addresses: Vec<String>,
        #[serde(with = "serde_str", default = "default_static_ttl")]
        ttl: Duration,
    },
    /// A/AAAA lookup of `hostname`; one target per address on `port`.
    Dns {
        hostname: String,
        port: u16,
        #[serde(with = "serde_str", default = "default_dns_ttl")]
        ttl: Duration,
    },
    /// SRV lookup of `dns_name`; freshness follows the record TTL.
    Srv { dns_name: String },
    /// Polls a Kubernetes Endpoints object through the API server.
    Kubernetes {
        namespace: String,
        service: String,
        /// Named endpoint port to use. Empty selects the first port.
        #[serde(default)]
        port_name: String,
        /// Plaintext API base URL, e.g. a `kubectl proxy` sidecar.
        #[serde(default = "default_kubernetes_api")]
        api_url: String,
        #[serde(with = "serde_str", default = "default_kubernetes_poll")]
        poll_interval: Duration,
    },
}

impl ResolverConfig {
    /// Short resolver kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolverConfig::Static { .. } => "static",
            ResolverConfig::Dns { .. } => "dns",
            ResolverConfig::Srv { .. } => "srv",
            ResolverConfig::Kubernetes { .. } => "kubernetes",
        }
    }
}

fn default_static_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_dns_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_kubernetes_api() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_kubernetes_poll() -> Duration {
    Duration::from_secs(5)
}

/// Load-balancing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Balancer {
    #[default]
    RoundRobin,
}

/// TLS settings for dialing a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Skip certificate verification. Only for test environments.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Server name for SNI and verification. Defaults to the target host.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// A middleware applied around calls to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MiddlewareConfig {
    Retry { attempts: u32 },
}
