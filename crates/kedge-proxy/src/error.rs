//! Error taxonomy for the dispatch core.
//!
//! Each component has its own error type. [`DispatchError`] is what the
//! directors hand to the transport layer: it flattens the component errors
//! into the kinds a client can see, and knows how to present itself over
//! HTTP and gRPC.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Response header marking requests refused by routing or ad-hoc
/// authorization.
pub const ROUTING_ERROR_HEADER: &str = "x-kedge-error";

/// Response header marking failures in name resolution, the pool or transport.
pub const TRANSPORT_ERROR_HEADER: &str = "x-kedge-transport-error";

pub type ResolveResult<T> = Result<T, ResolveError>;
pub type PoolResult<T> = Result<T, PoolError>;
pub type RouteResult<T> = Result<T, RouteError>;
pub type AdhocResult<T> = Result<T, AdhocError>;

/// Failures while producing a target list.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dns query for {name} failed: {source}")]
    Dns {
        name: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },

    #[error("address lookup for {name} failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid target address {0:?}")]
    InvalidAddress(String),

    #[error("kubernetes endpoints query failed: {0}")]
    Kubernetes(String),
}

/// Failures while dialing or preparing an upstream connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {address} timed out")]
    ConnectTimeout { address: String },

    #[error("tls handshake with {address} failed: {source}")]
    Tls {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid tls server name {0:?}")]
    InvalidServerName(String),

    #[error("tls configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("request to {address} failed: {source}")]
    Request {
        address: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("invalid grpc target {address}: {source}")]
    Channel {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Failures of the backend pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown backend {0:?}")]
    UnknownBackend(String),

    #[error("no live targets for backend {0:?}")]
    NoLiveTargets(String),

    #[error("backend {backend:?}: {source}")]
    Resolver {
        backend: String,
        #[source]
        source: ResolveError,
    },

    #[error("backend {backend:?}: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: UpstreamError,
    },
}

/// Failures of the HTTP and gRPC routers.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown route to service")]
    RouteNotFound,

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header name {0:?}")]
    InvalidHeader(String),

    #[error("route references backend {0:?} which is not in the pool")]
    UnknownBackend(String),
}

/// Failures of the ad-hoc addresser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdhocError {
    #[error("unknown route to service")]
    RouteNotFound,

    #[error("invalid authority {0:?}")]
    InvalidAuthority(String),

    #[error("malformed port {0:?}")]
    MalformedPort(String),

    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("cannot resolve host {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },
}

/// Outcome of a failed dispatch, as surfaced to the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown route to service")]
    RouteNotFound,

    #[error("invalid authority {0:?}")]
    InvalidAuthority(String),

    #[error("malformed port {0:?}")]
    MalformedPort(String),

    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),

    #[error("cannot resolve host {0}")]
    ResolutionFailed(String),

    #[error("unknown backend {0:?}")]
    UnknownBackend(String),

    #[error("no live targets for backend {0:?}")]
    NoLiveTargets(String),

    #[error("{0}")]
    Transport(String),
}

impl DispatchError {
    /// Whether the request itself was refused. Name resolution and
    /// everything after it count as gateway failures.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            DispatchError::RouteNotFound
                | DispatchError::InvalidAuthority(_)
                | DispatchError::MalformedPort(_)
                | DispatchError::PortNotAllowed(_)
        )
    }

    /// Header that tags the error response.
    pub fn marker_header(&self) -> &'static str {
        if self.is_routing() {
            ROUTING_ERROR_HEADER
        } else {
            TRANSPORT_ERROR_HEADER
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::RouteNotFound => StatusCode::NOT_FOUND,
            DispatchError::InvalidAuthority(_)
            | DispatchError::MalformedPort(_)
            | DispatchError::PortNotAllowed(_) => StatusCode::BAD_REQUEST,
            DispatchError::NoLiveTargets(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::ResolutionFailed(_)
            | DispatchError::UnknownBackend(_)
            | DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn grpc_code(&self) -> tonic::Code {
        match self {
            DispatchError::RouteNotFound | DispatchError::UnknownBackend(_) => {
                tonic::Code::Unimplemented
            }
            DispatchError::InvalidAuthority(_) | DispatchError::MalformedPort(_) => {
                tonic::Code::InvalidArgument
            }
            DispatchError::PortNotAllowed(_) => tonic::Code::PermissionDenied,
            DispatchError::ResolutionFailed(_)
            | DispatchError::NoLiveTargets(_)
            | DispatchError::Transport(_) => tonic::Code::Unavailable,
        }
    }
}

impl From<PoolError> for DispatchError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::UnknownBackend(name) => DispatchError::UnknownBackend(name),
            PoolError::NoLiveTargets(name) => DispatchError::NoLiveTargets(name),
            other => DispatchError::Transport(other.to_string()),
        }
    }
}

impl From<RouteError> for DispatchError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::RouteNotFound => DispatchError::RouteNotFound,
            RouteError::UnknownBackend(name) => DispatchError::UnknownBackend(name),
            other => DispatchError::Transport(other.to_string()),
        }
    }
}

impl From<AdhocError> for DispatchError {
    fn from(e: AdhocError) -> Self {
        match e {
            AdhocError::RouteNotFound => DispatchError::RouteNotFound,
            AdhocError::InvalidAuthority(a) => DispatchError::InvalidAuthority(a),
            AdhocError::MalformedPort(p) => DispatchError::MalformedPort(p),
            AdhocError::PortNotAllowed(p) => DispatchError::PortNotAllowed(p),
            AdhocError::ResolutionFailed { host, .. } => DispatchError::ResolutionFailed(host),
        }
    }
}

impl From<UpstreamError> for DispatchError {
    fn from(e: UpstreamError) -> Self {
        DispatchError::Transport(e.to_string())
    }
}
