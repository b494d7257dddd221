//! Outbound side of the relay: opening plain or TLS connections and
//! exchanging one request over them.

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{TunnelError, TunnelResult};
use crate::target::format_authority;

/// Transport used for the outbound leg of a tunneled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

impl Transport {
    /// Only the literal `http` selects plaintext. Anything else, including a
    /// missing value, goes over TLS.
    pub fn for_protocol(protocol: Option<&str>) -> Self {
        match protocol {
            Some("http") => Self::Plain,
            _ => Self::Tls,
        }
    }
}

/// Build the TLS connector used for encrypted upstream legs.
pub(crate) fn tls_connector() -> TunnelResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Where an outbound request is sent and how.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub transport: Transport,
    /// TLS server name; the destination host, matching the `Host` header.
    pub server_name: &'a str,
}

impl UpstreamTarget<'_> {
    pub fn authority(&self) -> String {
        format_authority(self.host, self.port)
    }
}

/// Open a fresh connection to `target` and send `request` over it.
///
/// The connection task runs with upgrade support so a `101` response can be
/// turned into a raw byte pipe by the caller.
pub(crate) async fn send(
    tls: &TlsConnector,
    target: &UpstreamTarget<'_>,
    request: Request<Incoming>,
) -> TunnelResult<Response<Incoming>> {
    let authority = target.authority();
    let stream = TcpStream::connect((target.host, target.port))
        .await
        .map_err(|e| TunnelError::upstream(&authority, e))?;
    stream.set_nodelay(true).ok();

    match target.transport {
        Transport::Plain => exchange(stream, request, &authority).await,
        Transport::Tls => {
            let name = ServerName::try_from(target.server_name.to_string())
                .map_err(|e| TunnelError::upstream(&authority, e))?;
            let stream = tls
                .connect(name, stream)
                .await
                .map_err(|e| TunnelError::upstream(&authority, e))?;
            exchange(stream, request, &authority).await
        }
    }
}

async fn exchange<S>(
    io: S,
    request: Request<Incoming>,
    authority: &str,
) -> TunnelResult<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| TunnelError::upstream(authority, e))?;

    let label = authority.to_string();
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!("Upstream connection to {} ended: {}", label, err);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| TunnelError::upstream(authority, e))
}
