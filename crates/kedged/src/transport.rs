//! Upstream HTTP exchange.
//!
//! Backend targets are reached through their pooled [`Endpoint`], which
//! keeps connections alive between requests. Ad-hoc destinations get a
//! one-off connection per request. Either way HTTP/2 is used when TLS
//! negotiated `h2`, HTTP/1.1 otherwise.

use bytes::Bytes;
use http::header::{CONNECTION, HOST, HeaderValue};
use http::{HeaderMap, HeaderName, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::debug;

use kedge_proxy::error::DispatchError;
use kedge_proxy::router::request_authority;
use kedge_proxy::upstream::BoxError;
use kedge_proxy::{DialedStream, Endpoint};

/// Body type of every response the gateway writes.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full(text: impl Into<Bytes>) -> ProxyBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text error response tagged with the error's marker header.
pub fn error_response(err: &DispatchError) -> Response<ProxyBody> {
    let mut resp = Response::new(full(err.to_string()));
    *resp.status_mut() = err.status_code();
    resp.headers_mut()
        .insert(err.marker_header(), HeaderValue::from_static("true"));
    resp
}

/// Send `req` to a backend target over one of its pooled connections and
/// return the response with its hop-by-hop headers removed.
pub async fn send_pooled(
    endpoint: &Endpoint,
    mut req: Request<Incoming>,
) -> Result<Response<Incoming>, DispatchError> {
    let authority = match request_authority(&req) {
        "" => endpoint.address().to_string(),
        a => a.to_string(),
    };
    strip_hop_by_hop(req.headers_mut());
    *req.uri_mut() = absolute_uri(req.uri(), endpoint.scheme(), &authority)?;
    *req.version_mut() = http::Version::HTTP_11;

    let req = req.map(|body| body.map_err(BoxError::from).boxed_unsync());
    let mut resp = endpoint.send(req).await?;
    strip_hop_by_hop(resp.headers_mut());
    Ok(resp)
}

/// Send `req` over a freshly dialed `stream` and return the upstream
/// response with its hop-by-hop headers removed.
///
/// `fallback_authority` is used when the request carries neither an
/// absolute URI nor a `Host` header.
pub async fn send_request<B>(
    stream: DialedStream,
    mut req: Request<B>,
    fallback_authority: &str,
) -> Result<Response<Incoming>, DispatchError>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let authority = match request_authority(&req) {
        "" => fallback_authority.to_string(),
        a => a.to_string(),
    };
    strip_hop_by_hop(req.headers_mut());

    let mut resp = if stream.is_h2() {
        *req.uri_mut() = absolute_uri(req.uri(), "https", &authority)?;
        req.headers_mut().remove(HOST);
        *req.version_mut() = http::Version::HTTP_2;

        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream h2 connection closed");
            }
        });
        sender.send_request(req).await.map_err(transport)?
    } else {
        *req.uri_mut() = origin_form(req.uri())?;
        if !req.headers().contains_key(HOST) {
            let host = HeaderValue::from_str(&authority).map_err(transport)?;
            req.headers_mut().insert(HOST, host);
        }
        *req.version_mut() = http::Version::HTTP_11;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream connection closed");
            }
        });
        sender.send_request(req).await.map_err(transport)?
    };

    strip_hop_by_hop(resp.headers_mut());
    Ok(resp)
}

fn transport(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Transport(e.to_string())
}

/// `/path?query` out of any request target.
fn origin_form(uri: &Uri) -> Result<Uri, DispatchError> {
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let path = if path.is_empty() { "/" } else { path };
    path.parse().map_err(transport)
}

/// `scheme://authority/path?query`.
fn absolute_uri(uri: &Uri, scheme: &str, authority: &str) -> Result<Uri, DispatchError> {
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(uri.path_and_query().map_or("/", |pq| pq.as_str()))
        .build()
        .map_err(transport)
}
