//! Configuration model for the kedge gateway.
//!
//! Everything the dispatch core consumes is described here as plain,
//! already-validated data: backends (how to discover and dial them),
//! HTTP and gRPC routes (how to pick a backend for a request), and ad-hoc
//! rules (which internal hosts and ports forward-proxy traffic may reach
//! directly).
//!
//! # Layout
//!
//! ```text
//! Config
//!   ├── server   listen addresses
//!   ├── pool     refresh bounds for backend resolution
//!   ├── http     backends, routes, adhoc rules
//!   └── grpc     backends, routes
//! ```
//!
//! Configuration is loaded from TOML with [`Config::from_file`] and checked
//! with [`Config::validate`] before any component is built from it.

pub mod backend;
pub mod config;
pub mod duration;
pub mod error;
pub mod route;

pub use backend::{Balancer, BackendConfig, MiddlewareConfig, ResolverConfig, SecurityConfig};
pub use config::{Config, GrpcConfig, HttpConfig, PoolConfig, ServerConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use route::{AdhocPort, AdhocRule, GrpcRoute, HttpRoute, PortRange, ProxyMode};
