//! HTTP listener: reverse proxy, forward proxy and CONNECT tunnels.
//!
//! Every request is tagged with its [`ProxyMode`] before it reaches the
//! director. Requests in absolute-form and `CONNECT` requests are forward
//! proxy traffic; everything else is reverse proxy traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kedge_config::ProxyMode;
use kedge_proxy::error::DispatchError;
use kedge_proxy::{DialedStream, Destination, HttpDirector};

use crate::transport::{self, ProxyBody};

/// HTTP gateway server.
pub struct HttpProxy {
    listener: TcpListener,
    director: Arc<HttpDirector>,
}

impl HttpProxy {
    pub async fn bind(addr: SocketAddr, director: Arc<HttpDirector>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
        Ok(Self::from_listener(listener, director))
    }

    pub fn from_listener(listener: TcpListener, director: Arc<HttpDirector>) -> Self {
        Self { listener, director }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips. One task per connection.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "HTTP gateway listening");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    let (stream, peer_addr) = accept_result.context("accept failed")?;
                    let director = self.director.clone();

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let director = director.clone();
                            async move { Ok::<_, hyper::Error>(handle(&director, req).await) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, svc)
                            .with_upgrades()
                            .await
                        {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("HTTP gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Forward proxy if the request names its target in the request line.
pub fn proxy_mode_of<B>(req: &Request<B>) -> ProxyMode {
    if req.method() == Method::CONNECT || req.uri().scheme().is_some() {
        ProxyMode::ForwardProxy
    } else {
        ProxyMode::ReverseProxy
    }
}

async fn handle(director: &HttpDirector, mut req: Request<Incoming>) -> Response<ProxyBody> {
    let mode = proxy_mode_of(&req);
    req.extensions_mut().insert(mode);

    let destination = match director.direct(&req).await {
        Ok(d) => d,
        Err(e) => {
            debug!(method = %req.method(), uri = %req.uri(), error = %e, "dispatch refused");
            return transport::error_response(&e);
        }
    };

    let result = match (&destination, req.method() == Method::CONNECT) {
        (_, true) => match destination.dial().await {
            Ok(stream) => return tunnel(req, stream, destination.address().to_string()),
            Err(e) => Err(DispatchError::from(e)),
        },
        (Destination::Backend { endpoint, .. }, false) => {
            transport::send_pooled(endpoint, req).await
        }
        (Destination::Adhoc { address }, false) => match destination.dial().await {
            Ok(stream) => transport::send_request(stream, req, address).await,
            Err(e) => Err(DispatchError::from(e)),
        },
    };

    match result {
        Ok(resp) => resp.map(BodyExt::boxed),
        Err(e) => {
            warn!(
                backend = destination.label(),
                address = destination.address(),
                error = %e,
                "upstream request failed"
            );
            transport::error_response(&e)
        }
    }
}

/// Answer `200` and splice the upgraded client connection with `upstream`.
fn tunnel(
    mut req: Request<Incoming>,
    mut upstream: DialedStream,
    address: String,
) -> Response<ProxyBody> {
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                error!(%address, error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, from_upstream)) => {
                debug!(%address, to_upstream, from_upstream, "tunnel closed");
            }
            Err(e) => debug!(%address, error = %e, "tunnel aborted"),
        }
    });

    let mut resp = Response::new(transport::empty());
    *resp.status_mut() = StatusCode::OK;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_is_tagged_on_the_request() {
        let mut req = Request::get("http://api.example.com/").body(()).unwrap();
        let mode = proxy_mode_of(&req);
        req.extensions_mut().insert(mode);
        assert_eq!(
            kedge_proxy::router::request_mode(&req),
            ProxyMode::ForwardProxy
        );
    }

    #[test]
    fn request_form_decides_mode() {
        let origin = Request::get("/v1/users").body(()).unwrap();
        assert_eq!(proxy_mode_of(&origin), ProxyMode::ReverseProxy);

        let absolute = Request::get("http://api.example.com/v1/users").body(()).unwrap();
        assert_eq!(proxy_mode_of(&absolute), ProxyMode::ForwardProxy);

        let connect = Request::builder()
            .method(Method::CONNECT)
            .uri("10-0-0-5.pods.test.local:9000")
            .body(())
            .unwrap();
        assert_eq!(proxy_mode_of(&connect), ProxyMode::ForwardProxy);
    }
}
