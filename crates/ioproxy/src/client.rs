//! Messaging client seam.
//!
//! The tunnel does not speak the messaging protocol itself. It hands a URL and
//! options to a [`MessagingClient`]; [`WebSocketClient`] is the default one.

use async_trait::async_trait;
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use url::Url;

use crate::error::{TunnelError, TunnelResult};

/// Options passed through to the messaging client.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Never reuse a pooled or multiplexed connection. Set by the tunnel for
    /// every relayed connection.
    pub force_new_connection: bool,
    /// Resource path to request instead of the URL's own path.
    pub path: Option<String>,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
    pub websocket: Option<WebSocketConfig>,
}

impl ConnectOptions {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A client able to open a messaging connection to a URL.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    type Connection: Send;

    async fn connect(&self, url: &str, options: ConnectOptions)
    -> TunnelResult<Self::Connection>;
}

/// WebSocket connection returned by [`WebSocketClient`].
pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`MessagingClient`] backed by `tokio-tungstenite`.
///
/// Every call performs a fresh handshake on a new socket, so
/// `force_new_connection` always holds.
#[derive(Debug, Clone, Default)]
pub struct WebSocketClient {
    disable_nagle: bool,
}

impl WebSocketClient {
    pub fn new() -> Self {
        Self {
            disable_nagle: true,
        }
    }

    /// Resolve the URL actually requested: `http`/`https` become `ws`/`wss`
    /// and `options.path` replaces the path.
    pub fn request_url(url: &str, options: &ConnectOptions) -> TunnelResult<Url> {
        let mut parsed = Url::parse(url).map_err(|e| TunnelError::invalid_url(url, e))?;
        let scheme = match parsed.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            "ws" | "wss" => None,
            other => {
                return Err(TunnelError::invalid_url(
                    url,
                    format!("unsupported scheme {other:?}"),
                ));
            }
        };
        if let Some(scheme) = scheme {
            parsed
                .set_scheme(scheme)
                .map_err(|()| TunnelError::invalid_url(url, "cannot switch scheme"))?;
        }
        if let Some(path) = options.path.as_deref() {
            parsed.set_path(path);
        }
        Ok(parsed)
    }
}

#[async_trait]
impl MessagingClient for WebSocketClient {
    type Connection = WsConnection;

    async fn connect(&self, url: &str, options: ConnectOptions) -> TunnelResult<WsConnection> {
        let target = Self::request_url(url, &options)?;
        let mut request = target.as_str().into_client_request()?;
        for (name, value) in &options.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TunnelError::InvalidHeader { name: name.clone() })?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| TunnelError::InvalidHeader { name: name.clone() })?;
            request.headers_mut().append(header_name, header_value);
        }

        debug!("Opening WebSocket connection to {}", target);
        let (stream, response) =
            connect_async_with_config(request, options.websocket, self.disable_nagle).await?;
        debug!("WebSocket handshake with {} returned {}", target, response.status());
        Ok(stream)
    }
}
