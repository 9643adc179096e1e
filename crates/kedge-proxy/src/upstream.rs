//! Upstream dialing.
//!
//! A [`Dialer`] opens TCP connections, optionally wrapped in TLS, to backend
//! targets. A [`Connector`] decides what the pool keeps per live target:
//! HTTP backends keep an [`Endpoint`] with its own keep-alive connection
//! pool, gRPC backends keep a multiplexed `tonic` channel shared by every
//! stream to that target.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use kedge_config::{BackendConfig, SecurityConfig};

use crate::error::UpstreamError;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body accepted by [`Endpoint::send`].
pub type UpstreamBody = UnsyncBoxBody<Bytes, BoxError>;

/// ALPN offered to HTTP backends.
pub const HTTP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];
/// ALPN offered to gRPC backends.
pub const GRPC_ALPN: &[&[u8]] = &[b"h2"];

// ── DialedStream ─────────────────────────────────────────────────────

/// A connected byte stream to a target.
pub enum DialedStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DialedStream {
    /// Whether TLS negotiated HTTP/2.
    pub fn is_h2(&self) -> bool {
        match self {
            DialedStream::Plain(_) => false,
            DialedStream::Tls(s) => s.get_ref().1.alpn_protocol() == Some(b"h2".as_slice()),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, DialedStream::Tls(_))
    }
}

impl Connection for DialedStream {
    fn connected(&self) -> Connected {
        if self.is_h2() {
            Connected::new().negotiated_h2()
        } else {
            Connected::new()
        }
    }
}

impl AsyncRead for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DialedStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── Dialer ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct TlsSettings {
    connector: TlsConnector,
    server_name: Option<String>,
}

/// Opens connections to targets of one backend.
#[derive(Clone)]
pub struct Dialer {
    tls: Option<TlsSettings>,
    connect_timeout: Duration,
}

impl Dialer {
    /// Plain TCP, used for ad-hoc destinations.
    pub fn plain() -> Self {
        Self {
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// TLS when `security` is present, plain TCP otherwise.
    pub fn new(security: Option<&SecurityConfig>, alpn: &[&[u8]]) -> Result<Self, UpstreamError> {
        let tls = match security {
            None => None,
            Some(sec) => {
                let mut config = client_config(sec.insecure_skip_verify)?;
                config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
                Some(TlsSettings {
                    connector: TlsConnector::from(Arc::new(config)),
                    server_name: sec.server_name.clone(),
                })
            }
        };
        Ok(Self {
            tls,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to `address` (`host:port`), completing the TLS handshake if configured.
    pub async fn dial(&self, address: &str) -> Result<DialedStream, UpstreamError> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout {
                address: address.to_string(),
            })?
            .map_err(|source| UpstreamError::Connect {
                address: address.to_string(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let Some(tls) = &self.tls else {
            debug!(%address, "dialed");
            return Ok(DialedStream::Plain(tcp));
        };

        let name = match &tls.server_name {
            Some(name) => name.clone(),
            None => host_of(address).to_string(),
        };
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| UpstreamError::InvalidServerName(name))?;

        let stream = tls
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| UpstreamError::Tls {
                address: address.to_string(),
                source,
            })?;
        debug!(%address, "dialed with tls");
        Ok(DialedStream::Tls(Box::new(stream)))
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn client_config(insecure_skip_verify: bool) -> Result<rustls::ClientConfig, UpstreamError> {
    let builder = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()?;

    let config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate. Backs `insecure_skip_verify`.
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

// ── Connectors ───────────────────────────────────────────────────────

/// Turns a resolved target into the handle the pool hands out.
///
/// `connect` must not block: anything slow (dialing, handshakes) happens
/// lazily on first use of the handle.
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Build the dialer shared by all targets of `backend`.
    fn dialer(&self, backend: &BackendConfig) -> Result<Dialer, UpstreamError>;

    fn connect(
        &self,
        backend: &str,
        address: &str,
        dialer: &Arc<Dialer>,
    ) -> Result<Self::Handle, UpstreamError>;
}

/// Dials one fixed target, whatever URI the client asks for.
#[derive(Clone)]
struct TargetDialer {
    dialer: Arc<Dialer>,
    address: Arc<str>,
}

impl tower::Service<Uri> for TargetDialer {
    type Response = TokioIo<DialedStream>;
    type Error = UpstreamError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        let address = Arc::clone(&self.address);
        Box::pin(async move { Ok(TokioIo::new(dialer.dial(&address).await?)) })
    }
}

/// A pooled HTTP target.
///
/// Requests sent through [`send`](Self::send) reuse idle keep-alive
/// connections to this target; new ones are dialed through the backend's
/// dialer. Clones share the connection pool, which closes once the last
/// clone is dropped.
#[derive(Clone)]
pub struct Endpoint {
    backend: Arc<str>,
    address: Arc<str>,
    dialer: Arc<Dialer>,
    client: Client<TargetDialer, UpstreamBody>,
}

impl Endpoint {
    fn new(backend: &str, address: &str, dialer: &Arc<Dialer>) -> Self {
        let address: Arc<str> = Arc::from(address);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_timer(TokioTimer::new())
            .build(TargetDialer {
                dialer: Arc::clone(dialer),
                address: Arc::clone(&address),
            });
        Self {
            backend: Arc::from(backend),
            address,
            dialer: Arc::clone(dialer),
            client,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.dialer.is_tls()
    }

    /// URI scheme requests to this target are sent with.
    pub fn scheme(&self) -> &'static str {
        if self.is_tls() { "https" } else { "http" }
    }

    /// A fresh connection outside the pool, for tunnels.
    pub async fn dial(&self) -> Result<DialedStream, UpstreamError> {
        self.dialer.dial(&self.address).await
    }

    /// Send `req` over a pooled connection. The URI must be absolute; its
    /// authority keys the pool and fills in `Host` when missing. HTTP/2 is
    /// used when TLS negotiated `h2`.
    pub async fn send(
        &self,
        req: Request<UpstreamBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        self.client
            .request(req)
            .await
            .map_err(|source| UpstreamError::Request {
                address: self.address.to_string(),
                source,
            })
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("backend", &self.backend)
            .field("address", &self.address)
            .field("tls", &self.is_tls())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointConnector;

impl Connector for EndpointConnector {
    type Handle = Endpoint;

    fn dialer(&self, backend: &BackendConfig) -> Result<Dialer, UpstreamError> {
        Dialer::new(backend.security.as_ref(), HTTP_ALPN)
    }

    fn connect(
        &self,
        backend: &str,
        address: &str,
        dialer: &Arc<Dialer>,
    ) -> Result<Endpoint, UpstreamError> {
        Ok(Endpoint::new(backend, address, dialer))
    }
}

/// One lazily connected HTTP/2 channel per gRPC target.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

impl Connector for GrpcConnector {
    type Handle = tonic::transport::Channel;

    fn dialer(&self, backend: &BackendConfig) -> Result<Dialer, UpstreamError> {
        Dialer::new(backend.security.as_ref(), GRPC_ALPN)
    }

    fn connect(
        &self,
        _backend: &str,
        address: &str,
        dialer: &Arc<Dialer>,
    ) -> Result<tonic::transport::Channel, UpstreamError> {
        // TLS, if any, is done by the dialer, so the channel always sees http://.
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{address}"))
            .map_err(|source| UpstreamError::Channel {
                address: address.to_string(),
                source,
            })?;

        let dialer = Arc::clone(dialer);
        let address = address.to_string();
        let channel = endpoint.connect_with_connector_lazy(tower::service_fn(
            move |_: http::Uri| {
                let dialer = Arc::clone(&dialer);
                let address = address.clone();
                async move {
                    let stream = dialer.dial(&address).await?;
                    Ok::<_, UpstreamError>(TokioIo::new(stream))
                }
            },
        ));
        Ok(channel)
    }
}
