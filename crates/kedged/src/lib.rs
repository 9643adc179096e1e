//! kedged, the kedge gateway daemon, as a library.
//!
//! Assembles the dispatch core from a [`Config`] and serves it:
//! - HTTP listener (reverse proxy, forward proxy, CONNECT)
//! - gRPC listener (HTTP/2 cleartext passthrough), when configured

pub mod grpc_proxy;
pub mod http_proxy;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use kedge_config::Config;
use kedge_proxy::{
    AdhocAddresser, BackendPool, EndpointConnector, GrpcConnector, GrpcDirector, GrpcRouter,
    HttpDirector, HttpRouter, PoolOptions,
};

pub use grpc_proxy::GrpcProxy;
pub use http_proxy::HttpProxy;

/// Build the HTTP director: router, ad-hoc addresser and a started pool.
pub async fn http_director(config: &Config) -> anyhow::Result<HttpDirector> {
    let router = HttpRouter::new(&config.http.routes).context("invalid HTTP routes")?;
    let pool = BackendPool::start(
        &config.http.backends,
        EndpointConnector,
        PoolOptions::from(&config.pool),
    )
    .await
    .context("failed to start HTTP backend pool")?;
    let addresser = AdhocAddresser::new(config.http.adhoc.clone());

    Ok(HttpDirector::new(router, addresser, Arc::new(pool))?)
}

/// Build the gRPC director over its own pool of channels.
pub async fn grpc_director(config: &Config) -> anyhow::Result<GrpcDirector> {
    let router = GrpcRouter::new(&config.grpc.routes).context("invalid gRPC routes")?;
    let pool = BackendPool::start(
        &config.grpc.backends,
        GrpcConnector,
        PoolOptions::from(&config.pool),
    )
    .await
    .context("failed to start gRPC backend pool")?;

    Ok(GrpcDirector::new(router, Arc::new(pool))?)
}

/// Compile every route without starting pools. Used by `kedged validate`.
pub fn check_routes(config: &Config) -> anyhow::Result<()> {
    HttpRouter::new(&config.http.routes).context("invalid HTTP routes")?;
    GrpcRouter::new(&config.grpc.routes).context("invalid gRPC routes")?;
    Ok(())
}

fn listen_addr(text: &str) -> anyhow::Result<SocketAddr> {
    text.parse()
        .with_context(|| format!("invalid listen address {text:?}"))
}

/// Serve until `shutdown` flips. The gRPC listener only runs when
/// `server.grpc_listen` is set.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let http_addr = listen_addr(&config.server.http_listen)?;
    let http = HttpProxy::bind(http_addr, Arc::new(http_director(&config).await?)).await?;
    info!(
        addr = %http_addr,
        backends = config.http.backends.len(),
        routes = config.http.routes.len(),
        adhoc_rules = config.http.adhoc.len(),
        "HTTP gateway ready"
    );
    let http_task = tokio::spawn(http.serve(shutdown.clone()));

    let grpc_task = if config.server.grpc_listen.is_empty() {
        None
    } else {
        let grpc_addr = listen_addr(&config.server.grpc_listen)?;
        let grpc = GrpcProxy::bind(grpc_addr, Arc::new(grpc_director(&config).await?)).await?;
        info!(
            addr = %grpc_addr,
            backends = config.grpc.backends.len(),
            routes = config.grpc.routes.len(),
            "gRPC gateway ready"
        );
        Some(tokio::spawn(grpc.serve(shutdown)))
    };

    http_task.await??;
    if let Some(task) = grpc_task {
        task.await??;
    }
    Ok(())
}
