//! HTTP server implementation.

use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admission::{admit, Admission};
use super::forward::{proxy, Forwarder};
use crate::config::RatekeeperConfig;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::RateLimiterBackend;

/// Build the gateway router: admission in front of forwarding, mounted under
/// `route_prefix`.
pub fn router(route_prefix: &str, admission: Admission, forwarder: Arc<Forwarder>) -> Router {
    let gateway = Router::new()
        .route("/", get(proxy))
        .route("/*path", get(proxy))
        .layer(middleware::from_fn_with_state(admission, admit))
        .with_state(forwarder);

    let prefix = route_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        gateway
    } else {
        Router::new().nest(prefix, gateway)
    }
}

/// HTTP server for the rate-limited gateway.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The assembled router
    router: Router,
}

impl HttpServer {
    /// Create a server from configuration and an admission backend.
    pub fn new(config: &RatekeeperConfig, limiter: Arc<dyn RateLimiterBackend>) -> Result<Self> {
        let forwarder = Arc::new(Forwarder::new(&config.upstream)?);
        let admission = Admission::new(
            limiter,
            config.rate_limiting.client_key,
            config.rate_limiting.failure_policy,
        );

        Ok(Self {
            addr: config.server.listen_addr,
            router: router(&config.server.route_prefix, admission, forwarder),
        })
    }

    /// Bind the listening socket.
    pub async fn bind(self) -> Result<BoundServer> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            RatekeeperError::Io(e)
        })?;

        Ok(BoundServer {
            listener,
            router: self.router,
        })
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.bind().await?.serve_with_shutdown(signal).await
    }
}

/// A server whose socket is already bound.
pub struct BoundServer {
    listener: TcpListener,
    router: Router,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %self.local_addr()?,
            "Starting rate-limited gateway with graceful shutdown"
        );

        // The admission middleware keys clients by peer address
        let service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(self.listener, service)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                RatekeeperError::Io(e)
            })
    }
}
