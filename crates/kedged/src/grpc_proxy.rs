//! gRPC listener (HTTP/2 cleartext).
//!
//! Each stream is handed to the channel the director picks and the
//! response is streamed back unchanged. The gateway never decodes
//! messages. Dispatch failures are answered in trailers-only form.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use kedge_proxy::GrpcDirector;
use kedge_proxy::error::DispatchError;

/// Body type on both sides of a relayed call.
pub type GrpcBody = UnsyncBoxBody<Bytes, tonic::Status>;

/// gRPC gateway server.
pub struct GrpcProxy {
    listener: TcpListener,
    director: Arc<GrpcDirector>,
}

impl GrpcProxy {
    pub async fn bind(addr: SocketAddr, director: Arc<GrpcDirector>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gRPC listener on {addr}"))?;
        Ok(Self::from_listener(listener, director))
    }

    pub fn from_listener(listener: TcpListener, director: Arc<GrpcDirector>) -> Self {
        Self { listener, director }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "gRPC gateway listening");

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

                        if let Err(e) = http2::Builder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            debug!(%peer_addr, error = %e, "gRPC connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("gRPC gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle(director: &GrpcDirector, req: Request<Incoming>) -> Response<GrpcBody> {
    let (backend, channel) = match director.direct(&req) {
        Ok(found) => found,
        Err(e) => {
            debug!(path = %req.uri().path(), error = %e, "grpc dispatch refused");
            return trailers_only(&e);
        }
    };

    let path = req.uri().path().to_string();
    let req = req.map(relay_body);
    match channel.oneshot(req).await {
        Ok(resp) => resp.map(relay_body),
        Err(e) => {
            warn!(%backend, %path, error = %e, "grpc upstream failed");
            trailers_only(&DispatchError::Transport(e.to_string()))
        }
    }
}

fn relay_body<B>(body: B) -> GrpcBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(|e| tonic::Status::from_error(e.into()))
        .boxed_unsync()
}

/// A gRPC error carried entirely in response headers.
pub fn trailers_only(err: &DispatchError) -> Response<GrpcBody> {
    let mut resp = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(err.marker_header(), HeaderValue::from_static("true"));

    let status = tonic::Status::new(err.grpc_code(), err.to_string());
    if let Err(e) = status.add_header(headers) {
        warn!(error = %e, "cannot encode grpc status");
    }
    resp
}
