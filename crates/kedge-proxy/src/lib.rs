//! kedge dispatch core: decides where each inbound request goes.
//!
//! # Components
//!
//! - **`resolver`**: target discovery (static, DNS, SRV, Kubernetes)
//! - **`upstream`**: TCP/TLS dialing and pooled per-target connections
//! - **`backendpool`**: live targets per backend with round-robin selection
//! - **`router`** / **`grpc_router`**: first-match routing rules
//! - **`adhoc`**: direct addressing for forward-proxy traffic
//! - **`director`**: composes the above for one request

pub mod adhoc;
pub mod backendpool;
pub mod director;
pub mod error;
pub mod grpc_router;
pub mod resolver;
pub mod router;
pub mod upstream;

pub use adhoc::{AdhocAddresser, LookupFn};
pub use backendpool::{BackendPool, PoolOptions};
pub use director::{Destination, GrpcDirector, HttpDirector};
pub use error::{
    AdhocError, DispatchError, PoolError, ROUTING_ERROR_HEADER, ResolveError, RouteError,
    TRANSPORT_ERROR_HEADER, UpstreamError,
};
pub use grpc_router::GrpcRouter;
pub use resolver::{Resolver, Target};
pub use router::HttpRouter;
pub use upstream::{
    Connector, DialedStream, Dialer, Endpoint, EndpointConnector, GrpcConnector, UpstreamBody,
};
