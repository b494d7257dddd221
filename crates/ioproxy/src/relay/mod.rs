//! Local relay server.
//!
//! The relay is an HTTP/1.1 listener on a fixed loopback port. Each inbound
//! request names its real destination in the `protocol`, `hostname` and
//! `port` query parameters. The relay forwards the request, through the
//! upstream proxy when one is configured, and streams both bodies through
//! unchanged. Upgrade requests (WebSocket) become a raw byte pipe once the
//! upstream answers `101 Switching Protocols`.

mod handler;
mod upstream;

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TunnelError, TunnelResult};
use crate::query::SharedQuery;
use crate::target::ProxyConfig;

pub use handler::{RelayBody, RoutingError, TunnelRequest};
pub use upstream::Transport;

use handler::RelayContext;

/// Port the relay listens on unless overridden.
pub const DEFAULT_RELAY_PORT: u16 = 61423;

/// Default loopback listen address for the relay.
pub fn default_relay_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_RELAY_PORT))
}

/// What the relay does with the inbound request when the upstream request fails.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorPolicy {
    /// Log the failure and leave the inbound request pending.
    #[default]
    Hold,
    /// Log the failure and answer `502 Bad Gateway`.
    BadGateway,
}

/// Settings for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Upstream proxy. Without one, requests go straight to their destination.
    pub proxy: Option<ProxyConfig>,
    pub on_upstream_error: UpstreamErrorPolicy,
    /// Baseline query set merged into every outbound request.
    pub shared_query: SharedQuery,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_relay_addr(),
            proxy: None,
            on_upstream_error: UpstreamErrorPolicy::default(),
            shared_query: SharedQuery::new(),
        }
    }
}

/// A running relay listener.
///
/// Dropping the server cancels its accept loop; [`RelayServer::stop`] also
/// waits until the listening socket has been released.
#[derive(Debug)]
pub struct RelayServer {
    local_addr: SocketAddr,
    proxy: Option<ProxyConfig>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind the listener and start accepting connections.
    pub async fn start(config: RelayConfig) -> TunnelResult<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| TunnelError::PortBind {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(RelayContext {
            proxy: config.proxy.clone(),
            shared_query: config.shared_query,
            on_upstream_error: config.on_upstream_error,
            tls: upstream::tls_connector()?,
        });

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        match &config.proxy {
            Some(proxy) => info!("Relay listening on {} via proxy {}", local_addr, proxy),
            None => info!("Relay listening on {} (direct upstream)", local_addr),
        }

        Ok(Self {
            local_addr,
            proxy: config.proxy,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Stop accepting connections and release the port.
    ///
    /// Connections that were already accepted keep running until they finish.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                warn!("Relay accept loop on {} panicked: {}", self.local_addr, err);
            }
        }
        info!("Relay on {} stopped", self.local_addr);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<RelayContext>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("Relay accept failed: {}", err);
                    continue;
                }
            },
        };

        debug!("Relay accepted connection from {}", peer);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(handler::handle(ctx, req).await) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!("Relay connection from {} ended: {}", peer, err);
            }
        });
    }
}
