//! Error types for configuration loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a kedge configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("duplicate {protocol} backend {name:?}")]
    DuplicateBackend { protocol: &'static str, name: String },

    #[error("{protocol} route #{index} references unknown backend {name:?}")]
    UnknownBackend {
        protocol: &'static str,
        index: usize,
        name: String,
    },

    #[error("backend {backend:?} has an invalid resolver: {reason}")]
    InvalidResolver { backend: String, reason: String },

    #[error("{protocol} route #{index} is invalid: {reason}")]
    InvalidRoute {
        protocol: &'static str,
        index: usize,
        reason: String,
    },

    #[error("adhoc rule #{index} is invalid: {reason}")]
    InvalidAdhocRule { index: usize, reason: String },

    #[error("invalid pool settings: {0}")]
    InvalidPool(String),
}
