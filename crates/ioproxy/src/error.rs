//! Error types for the tunnel and relay.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Boxed error carried by upstream failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while setting up or using a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A destination or proxy URL could not be parsed or is unusable.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The relay listener could not be bound.
    #[error("failed to bind relay listener on {addr}")]
    PortBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The outbound request to the proxy or destination failed.
    #[error("upstream request to {target} failed")]
    Upstream {
        target: String,
        #[source]
        source: BoxError,
    },

    /// TLS client configuration could not be built.
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    /// A header supplied in the connect options is not valid HTTP.
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    /// The messaging client handshake failed.
    #[error("messaging connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub(crate) fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn upstream(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Upstream {
            target: target.into(),
            source: source.into(),
        }
    }
}

/// Render an error followed by its `source()` chain, one cause per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
