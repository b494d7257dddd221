//! Per-request tunneling logic.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderMap, HeaderValue, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, error, warn};
use tokio_rustls::TlsConnector;

use super::UpstreamErrorPolicy;
use super::upstream::{self, Transport, UpstreamTarget};
use crate::error::{TunnelError, error_chain};
use crate::query::{QueryMap, SharedQuery};
use crate::target::{ProxyConfig, format_authority};

/// Body type returned by the relay.
pub type RelayBody = BoxBody<Bytes, hyper::Error>;

/// State shared by every request served by one relay.
pub(crate) struct RelayContext {
    pub proxy: Option<ProxyConfig>,
    pub shared_query: SharedQuery,
    pub on_upstream_error: UpstreamErrorPolicy,
    pub tls: TlsConnector,
}

/// Why an inbound request could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    MissingHostname,
    MissingPort,
    InvalidPort(String),
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHostname => write!(f, "missing hostname parameter"),
            Self::MissingPort => write!(f, "missing port parameter"),
            Self::InvalidPort(port) => write!(f, "invalid port parameter {port:?}"),
        }
    }
}

/// Destination and query state extracted from one inbound relay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub hostname: String,
    pub port: u16,
    pub protocol: Option<String>,
    /// Baseline query set after merging this request's extra keys.
    pub query: QueryMap,
}

impl TunnelRequest {
    /// Read the routing keys from `inbound` and merge its other keys into `shared`.
    pub fn extract(inbound: &QueryMap, shared: &SharedQuery) -> Result<Self, RoutingError> {
        let hostname = inbound
            .get("hostname")
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or(RoutingError::MissingHostname)?
            .to_string();
        let raw_port = inbound.get("port").ok_or(RoutingError::MissingPort)?;
        let port = raw_port
            .parse::<u16>()
            .map_err(|_| RoutingError::InvalidPort(raw_port.to_string()))?;

        Ok(Self {
            hostname,
            port,
            protocol: inbound.get("protocol").map(str::to_string),
            query: shared.merge_and_snapshot(inbound),
        })
    }

    pub fn authority(&self) -> String {
        format_authority(&self.hostname, self.port)
    }

    pub fn transport(&self) -> Transport {
        Transport::for_protocol(self.protocol.as_deref())
    }

    /// Inbound path with the merged query appended.
    pub fn outbound_path(&self, inbound_path: &str) -> String {
        let path = if inbound_path.is_empty() {
            "/"
        } else {
            inbound_path
        };
        // An empty merged query sends the bare path, without a trailing `?`.
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, self.query.to_query_string())
        }
    }
}

impl RelayContext {
    /// Host and port the outbound connection goes to: the proxy when one is
    /// configured, otherwise the destination itself.
    fn upstream_for<'a>(&'a self, request: &'a TunnelRequest) -> UpstreamTarget<'a> {
        let (host, port) = match &self.proxy {
            Some(proxy) => (proxy.hostname.as_str(), proxy.port),
            None => (request.hostname.as_str(), request.port),
        };
        UpstreamTarget {
            host,
            port,
            transport: request.transport(),
            server_name: &request.hostname,
        }
    }

    async fn upstream_failed(&self, err: TunnelError) -> Response<RelayBody> {
        error!("Error in relay upstream request: {}", err);
        error!("{}", error_chain(&err));
        match self.on_upstream_error {
            // The inbound request is left without a response until the client gives up.
            UpstreamErrorPolicy::Hold => std::future::pending::<Response<RelayBody>>().await,
            UpstreamErrorPolicy::BadGateway => status_response(StatusCode::BAD_GATEWAY),
        }
    }
}

/// Tunnel one inbound request to its destination.
pub(crate) async fn handle(ctx: Arc<RelayContext>, mut req: Request<Incoming>) -> Response<RelayBody> {
    let inbound_query = QueryMap::parse(req.uri().query().unwrap_or(""));
    let tunnel = match TunnelRequest::extract(&inbound_query, &ctx.shared_query) {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!("Rejecting relay request {}: {}", req.uri(), err);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let path = tunnel.outbound_path(req.uri().path());
    let uri: Uri = match path.parse() {
        Ok(uri) => uri,
        Err(err) => {
            warn!("Invalid outbound path {}: {}", path, err);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };
    let host = match HeaderValue::from_str(&tunnel.authority()) {
        Ok(host) => host,
        Err(err) => {
            warn!("Invalid Host header value {}: {}", tunnel.authority(), err);
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    let inbound_upgrade = is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    parts.headers.insert(HOST, host);
    let outbound = Request::from_parts(parts, body);

    let target = ctx.upstream_for(&tunnel);
    debug!(
        "Relaying {} {} for {} via {} ({:?})",
        outbound.method(),
        outbound.uri(),
        tunnel.authority(),
        target.authority(),
        target.transport
    );

    let mut response = match upstream::send(&ctx.tls, &target, outbound).await {
        Ok(response) => response,
        Err(err) => return ctx.upstream_failed(err).await,
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(inbound_upgrade) = inbound_upgrade {
            let outbound_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(splice(inbound_upgrade, outbound_upgrade, tunnel.authority()));
        }
    }

    response.map(|body| body.boxed())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
}

/// Pipe bytes both ways between the two upgraded connections until either side closes.
async fn splice(inbound: OnUpgrade, outbound: OnUpgrade, destination: String) {
    let (inbound, outbound) = match tokio::try_join!(inbound, outbound) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("Upgrade to {} failed: {}", destination, err);
            return;
        }
    };

    let mut inbound = TokioIo::new(inbound);
    let mut outbound = TokioIo::new(outbound);
    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((to_upstream, to_client)) => debug!(
            "Upgraded tunnel to {} closed ({} bytes up, {} bytes down)",
            destination, to_upstream, to_client
        ),
        Err(err) => debug!("Upgraded tunnel to {} ended: {}", destination, err),
    }
}

pub(crate) fn status_response(status: StatusCode) -> Response<RelayBody> {
    let body = Empty::<Bytes>::new().map_err(|never| match never {}).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
