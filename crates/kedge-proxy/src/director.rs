//! Directors compose router, addresser and pool for one request.
//!
//! A director holds no per-request state. It turns one inbound request
//! into a [`Destination`] (HTTP) or a channel (gRPC) and leaves the actual
//! byte moving to the transport layer.

use std::future::Future;
use std::sync::Arc;

use http::Request;
use tracing::debug;

use kedge_config::ProxyMode;

use crate::adhoc::AdhocAddresser;
use crate::backendpool::BackendPool;
use crate::error::{DispatchError, RouteError, RouteResult, UpstreamError};
use crate::grpc_router::GrpcRouter;
use crate::router::{HttpRouter, request_mode};
use crate::upstream::{Connector, DialedStream, Dialer, Endpoint, EndpointConnector, GrpcConnector};

/// Where an HTTP request should go.
#[derive(Debug, Clone)]
pub enum Destination {
    /// A pooled target of a named backend.
    Backend { name: String, endpoint: Endpoint },
    /// A literal address from the ad-hoc addresser, dialed fresh.
    Adhoc { address: String },
}

impl Destination {
    /// Open a fresh connection to the destination, outside any pool.
    /// Used for tunnels and ad-hoc requests.
    pub async fn dial(&self) -> Result<DialedStream, UpstreamError> {
        match self {
            Destination::Backend { endpoint, .. } => endpoint.dial().await,
            Destination::Adhoc { address } => Dialer::plain().dial(address).await,
        }
    }

    /// Backend name, or `adhoc` for direct destinations. Used in logs.
    pub fn label(&self) -> &str {
        match self {
            Destination::Backend { name, .. } => name,
            Destination::Adhoc { .. } => "adhoc",
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Destination::Backend { endpoint, .. } => endpoint.address(),
            Destination::Adhoc { address } => address,
        }
    }
}

/// Reject routers that reference backends the pool does not have.
fn check_backends<'a, C: Connector>(
    mut names: impl Iterator<Item = &'a str>,
    pool: &BackendPool<C>,
) -> RouteResult<()> {
    match names.find(|name| !pool.contains(name)) {
        Some(missing) => Err(RouteError::UnknownBackend(missing.to_string())),
        None => Ok(()),
    }
}

/// Sync part of an HTTP dispatch.
enum Decision {
    Done(Result<Destination, DispatchError>),
    Adhoc,
}

pub struct HttpDirector {
    router: HttpRouter,
    addresser: AdhocAddresser,
    pool: Arc<BackendPool<EndpointConnector>>,
}

impl HttpDirector {
    pub fn new(
        router: HttpRouter,
        addresser: AdhocAddresser,
        pool: Arc<BackendPool<EndpointConnector>>,
    ) -> RouteResult<Self> {
        check_backends(router.backend_names(), pool.as_ref())?;
        Ok(Self {
            router,
            addresser,
            pool,
        })
    }

    pub fn pool(&self) -> &Arc<BackendPool<EndpointConnector>> {
        &self.pool
    }

    /// Decide where `req` goes.
    ///
    /// Named routes win. Forward-proxy requests that match no route fall
    /// back to the ad-hoc addresser. Nothing is retried.
    pub fn direct<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = Result<Destination, DispatchError>> + Send + use<'_, B> {
        let decision = self.decide(req);
        let adhoc = matches!(decision, Decision::Adhoc).then(|| self.addresser.address(req));

        async move {
            match (decision, adhoc) {
                (Decision::Done(result), _) => result,
                (Decision::Adhoc, Some(address)) => {
                    let address = address.await?;
                    debug!(%address, "dispatching to adhoc destination");
                    Ok(Destination::Adhoc { address })
                }
                (Decision::Adhoc, None) => Err(DispatchError::RouteNotFound),
            }
        }
    }

    fn decide<B>(&self, req: &Request<B>) -> Decision {
        match self.router.route(req) {
            Ok(name) => {
                let result = self
                    .pool
                    .get(name)
                    .map(|endpoint| {
                        debug!(backend = %name, address = %endpoint.address(), "dispatching to backend");
                        Destination::Backend {
                            name: name.to_string(),
                            endpoint,
                        }
                    })
                    .map_err(DispatchError::from);
                Decision::Done(result)
            }
            Err(RouteError::RouteNotFound) if request_mode(req) == ProxyMode::ForwardProxy => {
                Decision::Adhoc
            }
            Err(e) => Decision::Done(Err(e.into())),
        }
    }
}

pub struct GrpcDirector {
    router: GrpcRouter,
    pool: Arc<BackendPool<GrpcConnector>>,
}

impl GrpcDirector {
    pub fn new(router: GrpcRouter, pool: Arc<BackendPool<GrpcConnector>>) -> RouteResult<Self> {
        check_backends(router.backend_names(), pool.as_ref())?;
        Ok(Self { router, pool })
    }

    pub fn pool(&self) -> &Arc<BackendPool<GrpcConnector>> {
        &self.pool
    }

    /// Backend name and channel for the call in `req`. There is no ad-hoc
    /// fallback for gRPC.
    pub fn direct<B>(
        &self,
        req: &Request<B>,
    ) -> Result<(String, tonic::transport::Channel), DispatchError> {
        let name = self.router.route(req)?;
        let channel = self.pool.get(name)?;
        debug!(backend = %name, path = %req.uri().path(), "dispatching grpc call");
        Ok((name.to_string(), channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::net::IpAddr;

    use kedge_config::{
        AdhocPort, AdhocRule, Balancer, BackendConfig, GrpcRoute, HttpRoute, PortRange,
        ResolverConfig,
    };

    use crate::adhoc::{LookupFn, LookupFuture};
    use crate::backendpool::PoolOptions;

    fn make_backend(name: &str, addresses: &[&str]) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            resolver: ResolverConfig::Static {
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                ttl: std::time::Duration::from_secs(60),
            },
            balancer: Balancer::RoundRobin,
            security: None,
            middleware: Vec::new(),
        }
    }

    fn make_route(backend: &str, paths: &[&str], host: &str, mode: ProxyMode) -> HttpRoute {
        HttpRoute {
            backend_name: backend.to_string(),
            path_rules: paths.iter().map(|p| p.to_string()).collect(),
            host_matcher: host.to_string(),
            header_matcher: HashMap::new(),
            proxy_mode: mode,
        }
    }

    fn stub_lookup() -> LookupFn {
        Arc::new(|_host: String| -> LookupFuture {
            Box::pin(async { Ok::<_, io::Error>(vec!["10.0.0.5".parse::<IpAddr>().unwrap()]) })
        })
    }

    async fn make_director(backends: &[BackendConfig], routes: &[HttpRoute]) -> HttpDirector {
        let pool = BackendPool::start(backends, EndpointConnector, PoolOptions::default())
            .await
            .unwrap();
        let addresser = AdhocAddresser::with_lookup(
            vec![AdhocRule {
                dns_name_matcher: "*.pods.test.local".to_string(),
                port: AdhocPort {
                    default: 0,
                    allowed: Vec::new(),
                    allowed_ranges: vec![PortRange { from: 1024, to: 65535 }],
                },
            }],
            stub_lookup(),
        );
        HttpDirector::new(HttpRouter::new(routes).unwrap(), addresser, Arc::new(pool)).unwrap()
    }

    fn make_request(uri: &str, host: &str, mode: ProxyMode) -> Request<()> {
        let mut req = Request::builder()
            .uri(uri)
            .header("host", host)
            .body(())
            .unwrap();
        req.extensions_mut().insert(mode);
        req
    }

    #[tokio::test]
    async fn routes_to_pooled_backend_round_robin() {
        let director = make_director(
            &[make_backend("api", &["10.0.0.1:8080", "10.0.0.2:8080"])],
            &[make_route("api", &["/v1/*"], "api.example.com", ProxyMode::ReverseProxy)],
        )
        .await;

        let req = make_request("/v1/users", "api.example.com", ProxyMode::ReverseProxy);
        let first = director.direct(&req).await.unwrap();
        let second = director.direct(&req).await.unwrap();

        assert_eq!(first.label(), "api");
        assert_eq!(first.address(), "10.0.0.1:8080");
        assert_eq!(second.address(), "10.0.0.2:8080");
    }

    #[tokio::test]
    async fn reverse_proxy_miss_is_route_not_found() {
        let director = make_director(
            &[make_backend("api", &["10.0.0.1:8080"])],
            &[make_route("api", &["/v1/*"], "api.example.com", ProxyMode::ReverseProxy)],
        )
        .await;

        let req = make_request("/v2/users", "api.example.com", ProxyMode::ReverseProxy);
        let err = director.direct(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::RouteNotFound));
        assert!(err.is_routing());
    }

    #[tokio::test]
    async fn forward_proxy_miss_falls_back_to_adhoc() {
        let director = make_director(&[], &[]).await;

        let req = make_request(
            "http://10-0-0-5.pods.test.local:9000/status",
            "10-0-0-5.pods.test.local:9000",
            ProxyMode::ForwardProxy,
        );
        match director.direct(&req).await.unwrap() {
            Destination::Adhoc { address } => assert_eq!(address, "10.0.0.5:9000"),
            other => panic!("expected adhoc destination, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn adhoc_port_rejection_surfaces() {
        let director = make_director(&[], &[]).await;
        let req = make_request(
            "http://10-0-0-5.pods.test.local:80/",
            "10-0-0-5.pods.test.local:80",
            ProxyMode::ForwardProxy,
        );
        let err = director.direct(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::PortNotAllowed(80)));
    }

    #[tokio::test]
    async fn reverse_proxy_never_uses_adhoc() {
        let director = make_director(&[], &[]).await;
        let req = make_request("/", "10-0-0-5.pods.test.local:9000", ProxyMode::ReverseProxy);
        assert!(matches!(
            director.direct(&req).await,
            Err(DispatchError::RouteNotFound)
        ));
    }

    #[tokio::test]
    async fn backend_without_targets_is_unavailable() {
        let director = make_director(
            &[make_backend("empty", &[])],
            &[make_route("empty", &[], "", ProxyMode::Any)],
        )
        .await;
        let req = make_request("/", "anything", ProxyMode::ReverseProxy);
        let err = director.direct(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoLiveTargets(_)));
        assert!(!err.is_routing());
    }

    #[tokio::test]
    async fn route_to_missing_backend_fails_construction() {
        let pool = BackendPool::start(&[], EndpointConnector, PoolOptions::default())
            .await
            .unwrap();
        let router = HttpRouter::new(&[make_route("ghost", &[], "", ProxyMode::Any)]).unwrap();
        let result = HttpDirector::new(router, AdhocAddresser::new(Vec::new()), Arc::new(pool));
        assert!(matches!(result, Err(RouteError::UnknownBackend(n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn grpc_director_hands_out_channel() {
        let pool = BackendPool::start(
            &[make_backend("controller", &["127.0.0.1:9"])],
            GrpcConnector,
            PoolOptions::default(),
        )
        .await
        .unwrap();
        let router = GrpcRouter::new(&[GrpcRoute {
            backend_name: "controller".to_string(),
            service_name_matcher: "kedge.test.*".to_string(),
            authority_matcher: String::new(),
            metadata_matcher: HashMap::new(),
        }])
        .unwrap();
        let director = GrpcDirector::new(router, Arc::new(pool)).unwrap();

        let call = Request::builder()
            .uri("/kedge.test.TestService/Ping")
            .body(())
            .unwrap();
        let (backend, _channel) = director.direct(&call).unwrap();
        assert_eq!(backend, "controller");

        let call = Request::builder().uri("/other.Service/Ping").body(()).unwrap();
        let err = director.direct(&call).unwrap_err();
        assert_eq!(err.grpc_code(), tonic::Code::Unimplemented);
    }
}
