//! gRPC call routing by service name, authority and metadata.

use http::{HeaderName, Request};
use regex::Regex;
use tracing::debug;

use kedge_config::GrpcRoute;

use crate::error::{RouteError, RouteResult};
use crate::router::{compile_glob, compile_headers, headers_match, host_matches, request_authority};

struct CompiledGrpcRoute {
    backend: String,
    service: Regex,
    authority: Option<String>,
    metadata: Vec<(HeaderName, String)>,
}

/// First-match router over gRPC routes.
pub struct GrpcRouter {
    routes: Vec<CompiledGrpcRoute>,
}

impl GrpcRouter {
    pub fn new(routes: &[GrpcRoute]) -> RouteResult<Self> {
        let routes = routes
            .iter()
            .map(|route| {
                let service = match route.service_name_matcher.as_str() {
                    "" => "*",
                    s => s,
                };
                Ok(CompiledGrpcRoute {
                    backend: route.backend_name.clone(),
                    service: compile_glob(service)?,
                    authority: (!route.authority_matcher.is_empty())
                        .then(|| route.authority_matcher.to_ascii_lowercase()),
                    metadata: compile_headers(route.metadata_matcher.iter())?,
                })
            })
            .collect::<RouteResult<Vec<_>>>()?;
        Ok(Self { routes })
    }

    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.backend.as_str())
    }

    /// Backend for the call in `req`, whose path is `/package.Service/Method`.
    pub fn route<B>(&self, req: &Request<B>) -> RouteResult<&str> {
        let service = service_name(req.uri().path()).ok_or(RouteError::RouteNotFound)?;
        let authority = request_authority(req);

        let route = self
            .routes
            .iter()
            .find(|r| {
                r.service.is_match(service)
                    && r.authority.as_deref().is_none_or(|want| host_matches(want, authority))
                    && headers_match(&r.metadata, req.headers())
            })
            .ok_or(RouteError::RouteNotFound)?;

        debug!(backend = %route.backend, service, "grpc route matched");
        Ok(&route.backend)
    }
}

/// `package.Service` out of `/package.Service/Method`.
fn service_name(path: &str) -> Option<&str> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_route(backend: &str, service: &str) -> GrpcRoute {
        GrpcRoute {
            backend_name: backend.to_string(),
            service_name_matcher: service.to_string(),
            authority_matcher: String::new(),
            metadata_matcher: HashMap::new(),
        }
    }

    fn make_call(path: &str) -> Request<()> {
        Request::builder()
            .method("POST")
            .uri(format!("http://gateway.local{path}"))
            .header("content-type", "application/grpc")
            .body(())
            .unwrap()
    }

    #[test]
    fn splits_service_from_method() {
        assert_eq!(service_name("/kedge.test.TestService/Ping"), Some("kedge.test.TestService"));
        assert_eq!(service_name("/grpc.health.v1.Health/Check"), Some("grpc.health.v1.Health"));
        assert_eq!(service_name("/NoMethod"), None);
        assert_eq!(service_name("/a/b/c"), None);
        assert_eq!(service_name("/svc/"), None);
    }

    #[test]
    fn routes_by_service_glob() {
        let router = GrpcRouter::new(&[
            make_route("controller", "kedge.test.*"),
            make_route("fallback", ""),
        ])
        .unwrap();

        let call = make_call("/kedge.test.TestService/Ping");
        assert_eq!(router.route(&call).unwrap(), "controller");

        let call = make_call("/other.Service/Get");
        assert_eq!(router.route(&call).unwrap(), "fallback");
    }

    #[test]
    fn authority_and_metadata_must_match() {
        let mut route = make_route("tenant", "*");
        route.authority_matcher = "gateway.local".to_string();
        route
            .metadata_matcher
            .insert("x-tenant".to_string(), "acme".to_string());
        let router = GrpcRouter::new(&[route]).unwrap();

        let mut call = make_call("/svc.S/M");
        assert!(matches!(router.route(&call), Err(RouteError::RouteNotFound)));

        call.headers_mut().insert("x-tenant", "acme".parse().unwrap());
        assert_eq!(router.route(&call).unwrap(), "tenant");
    }

    #[test]
    fn malformed_path_is_route_not_found() {
        let router = GrpcRouter::new(&[make_route("any", "")]).unwrap();
        assert!(router.route(&make_call("/")).is_err());
    }
}
