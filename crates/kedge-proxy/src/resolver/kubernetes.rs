//! Kubernetes Endpoints polling.
//!
//! Talks plain HTTP to an API server address such as a `kubectl proxy`
//! sidecar, which takes care of authentication.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Resolver, Target, dedup_targets};
use crate::error::{ResolveError, ResolveResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KubernetesResolver {
    /// `host:port` of the API server.
    authority: String,
    /// Request path of the Endpoints object.
    path: String,
    port_name: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
struct EndpointAddress {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct EndpointPort {
    #[serde(default)]
    name: String,
    port: u16,
}

impl KubernetesResolver {
    pub fn new(
        api_url: &str,
        namespace: &str,
        service: &str,
        port_name: &str,
        poll_interval: Duration,
    ) -> ResolveResult<Self> {
        let uri: http::Uri = api_url
            .parse()
            .map_err(|e| ResolveError::Kubernetes(format!("invalid api url {api_url:?}: {e}")))?;
        if uri.scheme_str() != Some("http") {
            return Err(ResolveError::Kubernetes(format!(
                "api url {api_url:?} must use http://"
            )));
        }
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ResolveError::Kubernetes(format!("api url {api_url:?} has no host")))?;
        let base = uri.path().trim_end_matches('/');

        Ok(Self {
            authority,
            path: format!("{base}/api/v1/namespaces/{namespace}/endpoints/{service}"),
            port_name: port_name.to_string(),
            poll_interval,
        })
    }

    async fn fetch(&self) -> ResolveResult<Bytes> {
        let err = |what: &str, e: &dyn std::fmt::Display| {
            ResolveError::Kubernetes(format!("{what} {}{}: {e}", self.authority, self.path))
        };

        let stream = TcpStream::connect(self.authority.as_str())
            .await
            .map_err(|e| err("connect to", &e))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| err("handshake with", &e))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(self.path.as_str())
            .header("host", self.authority.as_str())
            .header("accept", "application/json")
            .header("user-agent", "kedge/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| err("build request for", &e))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| err("request to", &e))?;
        if !resp.status().is_success() {
            return Err(err("unexpected status from", &resp.status()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| err("read body from", &e))?;
        Ok(body.to_bytes())
    }
}

#[async_trait]
impl Resolver for KubernetesResolver {
    async fn resolve(&self) -> ResolveResult<Vec<Target>> {
        let body = tokio::time::timeout(REQUEST_TIMEOUT, self.fetch())
            .await
            .map_err(|_| ResolveError::Kubernetes(format!("request to {} timed out", self.authority)))??;

        let deadline = Instant::now() + self.poll_interval;
        let targets = parse_endpoints(&body, &self.port_name, deadline)?;
        debug!(path = %self.path, count = targets.len(), "kubernetes endpoints resolved");
        Ok(targets)
    }
}

/// Ready addresses paired with the selected port of their subset.
fn parse_endpoints(body: &[u8], port_name: &str, deadline: Instant) -> ResolveResult<Vec<Target>> {
    let endpoints: Endpoints = serde_json::from_slice(body)
        .map_err(|e| ResolveError::Kubernetes(format!("invalid endpoints object: {e}")))?;

    let mut targets = Vec::new();
    for subset in &endpoints.subsets {
        let port = if port_name.is_empty() {
            subset.ports.first()
        } else {
            subset.ports.iter().find(|p| p.name == port_name)
        };
        let Some(port) = port else { continue };

        for address in &subset.addresses {
            let ip: IpAddr = address
                .ip
                .parse()
                .map_err(|_| ResolveError::InvalidAddress(address.ip.clone()))?;
            targets.push(Target::new(SocketAddr::new(ip, port.port).to_string(), deadline));
        }
    }
    Ok(dedup_targets(targets))
}
