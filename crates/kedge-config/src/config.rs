//! kedge.toml configuration file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{BackendConfig, ResolverConfig};
use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};
use crate::route::{AdhocRule, GrpcRoute, HttpRoute};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for HTTP reverse/forward proxy traffic.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Listen address for gRPC (h2c) traffic. Empty disables the listener.
    #[serde(default)]
    pub grpc_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            grpc_listen: String::new(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Bounds for the backend pool's refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Shortest wait between two resolutions of one backend.
    #[serde(with = "serde_str", default = "default_min_refresh")]
    pub min_refresh: Duration,
    /// Longest wait between two resolutions of one backend.
    #[serde(with = "serde_str", default = "default_max_refresh")]
    pub max_refresh: Duration,
    /// Cap for the exponential backoff after resolver failures.
    #[serde(with = "serde_str", default = "default_error_backoff_max")]
    pub error_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_refresh: default_min_refresh(),
            max_refresh: default_max_refresh(),
            error_backoff_max: default_error_backoff_max(),
        }
    }
}

fn default_min_refresh() -> Duration {
    Duration::from_secs(1)
}

fn default_max_refresh() -> Duration {
    Duration::from_secs(60)
}

fn default_error_backoff_max() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub routes: Vec<HttpRoute>,
    #[serde(default)]
    pub adhoc: Vec<AdhocRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub routes: Vec<GrpcRoute>,
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = ?path, "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references and value ranges.
    ///
    /// Routes are checked against backends here so that the dispatch core
    /// never sees a route pointing at a backend it does not know.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pool.min_refresh.is_zero() {
            return Err(ConfigError::InvalidPool("min_refresh must be positive".into()));
        }
        if self.pool.min_refresh > self.pool.max_refresh {
            return Err(ConfigError::InvalidPool(format!(
                "min_refresh {:?} exceeds max_refresh {:?}",
                self.pool.min_refresh, self.pool.max_refresh
            )));
        }

        let http_names = validate_backends("http", &self.http.backends)?;
        for (index, route) in self.http.routes.iter().enumerate() {
            if !http_names.contains(route.backend_name.as_str()) {
                return Err(ConfigError::UnknownBackend {
                    protocol: "http",
                    index,
                    name: route.backend_name.clone(),
                });
            }
            if let Some(bad) = route
                .path_rules
                .iter()
                .find(|p| !(p.starts_with('/') || p.starts_with('*')))
            {
                return Err(ConfigError::InvalidRoute {
                    protocol: "http",
                    index,
                    reason: format!("path rule {bad:?} must start with '/' or '*'"),
                });
            }
        }

        let grpc_names = validate_backends("grpc", &self.grpc.backends)?;
        for (index, route) in self.grpc.routes.iter().enumerate() {
            if !grpc_names.contains(route.backend_name.as_str()) {
                return Err(ConfigError::UnknownBackend {
                    protocol: "grpc",
                    index,
                    name: route.backend_name.clone(),
                });
            }
        }

        for (index, rule) in self.http.adhoc.iter().enumerate() {
            validate_adhoc(index, rule)?;
        }

        Ok(())
    }
}

fn validate_backends<'a>(
    protocol: &'static str,
    backends: &'a [BackendConfig],
) -> ConfigResult<HashSet<&'a str>> {
    let mut names = HashSet::new();
    for backend in backends {
        if backend.name.is_empty() {
            return Err(ConfigError::InvalidResolver {
                backend: String::new(),
                reason: "backend name must not be empty".into(),
            });
        }
        if !names.insert(backend.name.as_str()) {
            return Err(ConfigError::DuplicateBackend {
                protocol,
                name: backend.name.clone(),
            });
        }
        validate_resolver(&backend.name, &backend.resolver)?;
    }
    Ok(names)
}

fn validate_resolver(backend: &str, resolver: &ResolverConfig) -> ConfigResult<()> {
    let invalid = |reason: &str| ConfigError::InvalidResolver {
        backend: backend.to_string(),
        reason: reason.to_string(),
    };

    match resolver {
        ResolverConfig::Static { addresses, .. } => {
            if addresses.is_empty() {
                return Err(invalid("static resolver needs at least one address"));
            }
            for addr in addresses {
                let port = addr.rsplit_once(':').map(|(_, p)| p.parse::<u16>());
                if !matches!(port, Some(Ok(_))) {
                    return Err(invalid(&format!("address {addr:?} is not host:port")));
                }
            }
        }
        ResolverConfig::Dns { hostname, port, .. } => {
            if hostname.is_empty() {
                return Err(invalid("dns resolver needs a hostname"));
            }
            if *port == 0 {
                return Err(invalid("dns resolver needs a non-zero port"));
            }
        }
        ResolverConfig::Srv { dns_name } => {
            if dns_name.is_empty() {
                return Err(invalid("srv resolver needs a dns_name"));
            }
        }
        ResolverConfig::Kubernetes {
            namespace,
            service,
            api_url,
            ..
        } => {
            if namespace.is_empty() || service.is_empty() {
                return Err(invalid("kubernetes resolver needs namespace and service"));
            }
            if !api_url.starts_with("http://") {
                return Err(invalid("kubernetes api_url must be a plain http:// URL"));
            }
        }
    }
    Ok(())
}

fn validate_adhoc(index: usize, rule: &AdhocRule) -> ConfigResult<()> {
    let invalid = |reason: String| ConfigError::InvalidAdhocRule { index, reason };

    let matcher = rule.dns_name_matcher.as_str();
    if matcher.is_empty() {
        warn!(index, "adhoc rule has an empty dns_name_matcher and will never match");
    } else if matcher == "*" || matcher == "*." {
        return Err(invalid(format!("dns_name_matcher {matcher:?} is too broad")));
    }
    if let Some(range) = rule.port.allowed_ranges.iter().find(|r| r.from > r.to) {
        return Err(invalid(format!(
            "port range {}-{} is inverted",
            range.from, range.to
        )));
    }
    Ok(())
}
