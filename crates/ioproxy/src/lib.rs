//! Real-time messaging connections through an HTTP forward proxy.
//!
//! [`Tunnel::connect`] opens a WebSocket connection either directly or, when a
//! proxy is configured, through a local relay that forwards the stream to the
//! real destination via the proxy. The free functions [`init`] and [`connect`]
//! use one process-wide tunnel.
//!
//! ```no_run
//! # async fn run() -> ioproxy::TunnelResult<()> {
//! ioproxy::init(Some("http://proxy.corp:3128")).await?;
//! let ws = ioproxy::connect("wss://chat.example.com/socket", Default::default()).await?;
//! # drop(ws);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod query;
pub mod relay;
pub mod settings;
pub mod target;
pub mod tunnel;

use once_cell::sync::Lazy;

pub use client::{ConnectOptions, MessagingClient, WebSocketClient, WsConnection};
pub use error::{TunnelError, TunnelResult};
pub use query::{QueryMap, SharedQuery};
pub use relay::{
    DEFAULT_RELAY_PORT, RelayConfig, RelayServer, Transport, TunnelRequest, UpstreamErrorPolicy,
};
pub use settings::Settings;
pub use target::{DestinationTarget, ProxyConfig};
pub use tunnel::{Tunnel, TunnelBuilder};

/// Environment variables consulted for the proxy URL, in order.
pub const PROXY_ENV_VARS: [&str; 2] = ["http_proxy", "HTTP_PROXY"];

static DEFAULT_TUNNEL: Lazy<Tunnel> = Lazy::new(|| Tunnel::new(WebSocketClient::new()));

/// The process-wide tunnel used by [`init`] and [`connect`].
pub fn default_tunnel() -> &'static Tunnel {
    &DEFAULT_TUNNEL
}

/// (Re)initialize the process-wide relay. See [`Tunnel::init`].
pub async fn init(proxy_url: Option<&str>) -> TunnelResult<()> {
    DEFAULT_TUNNEL.init(proxy_url).await
}

/// Connect through the process-wide tunnel. See [`Tunnel::connect`].
pub async fn connect(destination_url: &str, options: ConnectOptions) -> TunnelResult<WsConnection> {
    DEFAULT_TUNNEL.connect(destination_url, options).await
}
