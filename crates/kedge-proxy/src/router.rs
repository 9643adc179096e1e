//! HTTP request routing: maps a request to a backend name.
//!
//! Routes are checked in configured order and the first one whose proxy
//! mode, host, path and header predicates all hold wins.

use http::header::HOST;
use http::{HeaderMap, HeaderName, Request};
use regex::Regex;
use tracing::debug;

use kedge_config::{HttpRoute, ProxyMode};

use crate::error::{RouteError, RouteResult};

/// A route with its patterns compiled.
struct CompiledRoute {
    backend: String,
    paths: Vec<Regex>,
    /// Lowercased; `None` skips the check.
    host: Option<String>,
    headers: Vec<(HeaderName, String)>,
    mode: ProxyMode,
}

/// First-match router over HTTP routes.
pub struct HttpRouter {
    routes: Vec<CompiledRoute>,
}

impl HttpRouter {
    pub fn new(routes: &[HttpRoute]) -> RouteResult<Self> {
        let routes = routes
            .iter()
            .map(|route| {
                let patterns: Vec<&str> = if route.path_rules.is_empty() {
                    vec!["/*"]
                } else {
                    route.path_rules.iter().map(String::as_str).collect()
                };
                Ok(CompiledRoute {
                    backend: route.backend_name.clone(),
                    paths: patterns
                        .into_iter()
                        .map(compile_glob)
                        .collect::<RouteResult<_>>()?,
                    host: (!route.host_matcher.is_empty())
                        .then(|| route.host_matcher.to_ascii_lowercase()),
                    headers: compile_headers(route.header_matcher.iter())?,
                    mode: route.proxy_mode,
                })
            })
            .collect::<RouteResult<Vec<_>>>()?;

        Ok(Self { routes })
    }

    /// Backend names referenced by the routes, in route order.
    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.backend.as_str())
    }

    /// Name of the backend that should serve `req`.
    ///
    /// The request's proxy mode is read from its extensions; requests
    /// without one are treated as reverse-proxy traffic.
    pub fn route<B>(&self, req: &Request<B>) -> RouteResult<&str> {
        let mode = request_mode(req);
        let host = request_authority(req);
        let path = match req.uri().path() {
            "" => "/",
            p => p,
        };

        let route = self
            .routes
            .iter()
            .find(|r| {
                r.mode.accepts(mode)
                    && r.host.as_deref().is_none_or(|want| host_matches(want, host))
                    && r.paths.iter().any(|p| p.is_match(path))
                    && headers_match(&r.headers, req.headers())
            })
            .ok_or(RouteError::RouteNotFound)?;

        debug!(backend = %route.backend, host, path, ?mode, "http route matched");
        Ok(&route.backend)
    }
}

/// Proxy mode tagged on the request by the listener.
pub fn request_mode<B>(req: &Request<B>) -> ProxyMode {
    req.extensions()
        .get::<ProxyMode>()
        .copied()
        .unwrap_or(ProxyMode::ReverseProxy)
}

/// Target authority: the URI's for absolute and authority form, otherwise
/// the `Host` header.
pub fn request_authority<B>(req: &Request<B>) -> &str {
    if let Some(authority) = req.uri().authority() {
        return authority.as_str();
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Case-insensitive host comparison. A matcher without a port ignores the
/// request's port.
pub(crate) fn host_matches(want: &str, authority: &str) -> bool {
    if authority.eq_ignore_ascii_case(want) {
        return true;
    }
    if want.contains(':') {
        return false;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host.eq_ignore_ascii_case(want)
        }
        _ => false,
    }
}

/// Compile a glob (`*` any run of characters, `?` one character) into an
/// anchored regex.
pub(crate) fn compile_glob(pattern: &str) -> RouteResult<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|source| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

pub(crate) fn compile_headers<'a>(
    matchers: impl Iterator<Item = (&'a String, &'a String)>,
) -> RouteResult<Vec<(HeaderName, String)>> {
    matchers
        .map(|(name, value)| {
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map(|n| (n, value.clone()))
                .map_err(|_| RouteError::InvalidHeader(name.clone()))
        })
        .collect()
}

/// Every matcher must find a header with exactly its value.
pub(crate) fn headers_match(matchers: &[(HeaderName, String)], headers: &HeaderMap) -> bool {
    matchers.iter().all(|(name, want)| {
        headers
            .get_all(name)
            .iter()
            .any(|v| v.as_bytes() == want.as_bytes())
    })
}
