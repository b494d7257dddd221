//! Destination and proxy URL parsing.

use url::{Host, Url};

use crate::error::{TunnelError, TunnelResult};
use crate::query::QueryMap;

/// Schemes that default to port 443 and a TLS transport.
const SECURE_SCHEMES: [&str; 2] = ["https", "wss"];

pub fn is_secure_scheme(scheme: &str) -> bool {
    SECURE_SCHEMES.contains(&scheme)
}

/// Default port for a scheme: 443 for secure schemes, 80 otherwise.
pub fn default_port(scheme: &str) -> u16 {
    if is_secure_scheme(scheme) { 443 } else { 80 }
}

/// `host:port`, with IPv6 literals bracketed.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Host of `url` in connectable form: IPv6 literals lose their brackets.
fn bare_host(url: &Url, raw: &str) -> TunnelResult<String> {
    match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => Ok(domain.to_string()),
        Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        _ => Err(TunnelError::invalid_url(raw, "missing host")),
    }
}

/// The real endpoint a messaging connection is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTarget {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub query: QueryMap,
}

impl DestinationTarget {
    pub fn parse(raw: &str) -> TunnelResult<Self> {
        let url = Url::parse(raw).map_err(|e| TunnelError::invalid_url(raw, e))?;
        let hostname = bare_host(&url, raw)?;
        let scheme = url.scheme().to_string();
        let port = url.port().unwrap_or_else(|| default_port(&scheme));

        Ok(Self {
            port,
            hostname,
            path: url.path().to_string(),
            query: QueryMap::parse(url.query().unwrap_or("")),
            scheme,
        })
    }

    /// Value of the relay `protocol` parameter for this destination.
    ///
    /// WebSocket schemes map onto their HTTP counterparts so that `ws` keeps a
    /// plaintext upstream.
    pub fn relay_protocol(&self) -> &str {
        match self.scheme.as_str() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        }
    }

    /// `hostname:port`, as sent in the upstream `Host` header.
    pub fn authority(&self) -> String {
        format_authority(&self.hostname, self.port)
    }
}

/// Upstream HTTP forward proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    /// Query pairs carried on the proxy URL itself.
    pub extra_query: QueryMap,
}

impl ProxyConfig {
    /// Parse a proxy URL such as `http://proxy.corp:3128`.
    ///
    /// A value without a scheme (`proxy.corp:3128`) is read as `http://`.
    pub fn parse(raw: &str) -> TunnelResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TunnelError::invalid_url(raw, "empty proxy URL"));
        }
        let url = if trimmed.contains("://") {
            Url::parse(trimmed).map_err(|e| TunnelError::invalid_url(raw, e))?
        } else {
            Url::parse(&format!("http://{trimmed}")).map_err(|e| TunnelError::invalid_url(raw, e))?
        };

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(TunnelError::invalid_url(
                raw,
                format!("unsupported proxy scheme {scheme:?}"),
            ));
        }
        let hostname = bare_host(&url, raw)?;
        let port = url.port().unwrap_or_else(|| default_port(&scheme));

        Ok(Self {
            scheme,
            hostname,
            port,
            extra_query: QueryMap::parse(url.query().unwrap_or("")),
        })
    }

    pub fn authority(&self) -> String {
        format_authority(&self.hostname, self.port)
    }
}

impl std::fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Choose the proxy URL: explicit argument first, then the environment.
///
/// Empty values count as unset. Returns `None` for direct-connection mode.
pub fn resolve_proxy_url(
    explicit: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    if let Some(url) = explicit {
        return Some(url.to_string());
    }
    crate::PROXY_ENV_VARS
        .iter()
        .filter_map(|name| env(name))
        .find(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_defaults_port_by_scheme() {
        assert_eq!(DestinationTarget::parse("http://example.com").unwrap().port, 80);
        assert_eq!(DestinationTarget::parse("https://example.com").unwrap().port, 443);
        assert_eq!(DestinationTarget::parse("ws://example.com/chat").unwrap().port, 80);
        assert_eq!(DestinationTarget::parse("wss://example.com/chat").unwrap().port, 443);
    }

    #[test]
    fn destination_keeps_explicit_port_path_and_query() {
        let target = DestinationTarget::parse("https://example.com:8443/path?x=1").unwrap();
        assert_eq!(target.hostname, "example.com");
        assert_eq!(target.port, 8443);
        assert_eq!(target.path, "/path");
        assert_eq!(target.query.to_query_string(), "x=1");
        assert_eq!(target.authority(), "example.com:8443");
    }

    #[test]
    fn destination_explicit_default_port_is_kept() {
        let target = DestinationTarget::parse("https://example.com:443/").unwrap();
        assert_eq!(target.port, 443);
    }

    #[test]
    fn destination_rejects_malformed_urls() {
        assert!(matches!(
            DestinationTarget::parse("not a url"),
            Err(TunnelError::InvalidUrl { .. })
        ));
        assert!(matches!(
            DestinationTarget::parse("mailto:someone@example.com"),
            Err(TunnelError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn ipv6_hosts_are_stored_without_brackets() {
        let target = DestinationTarget::parse("ws://[::1]:9000/chat").unwrap();
        assert_eq!(target.hostname, "::1");
        assert_eq!(target.authority(), "[::1]:9000");

        let proxy = ProxyConfig::parse("[::1]:3128").unwrap();
        assert_eq!(proxy.hostname, "::1");
        assert_eq!(proxy.to_string(), "http://[::1]:3128");

        assert_eq!(format_authority("127.0.0.1", 80), "127.0.0.1:80");
    }

    #[test]
    fn relay_protocol_maps_websocket_schemes() {
        let ws = DestinationTarget::parse("ws://example.com").unwrap();
        let wss = DestinationTarget::parse("wss://example.com").unwrap();
        let https = DestinationTarget::parse("https://example.com").unwrap();
        assert_eq!(ws.relay_protocol(), "http");
        assert_eq!(wss.relay_protocol(), "https");
        assert_eq!(https.relay_protocol(), "https");
    }

    #[test]
    fn proxy_parses_full_url() {
        let proxy = ProxyConfig::parse("http://proxy.corp:3128/?region=eu").unwrap();
        assert_eq!(proxy.hostname, "proxy.corp");
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.extra_query.get("region"), Some("eu"));
        assert_eq!(proxy.to_string(), "http://proxy.corp:3128");
    }

    #[test]
    fn proxy_without_scheme_is_http() {
        let proxy = ProxyConfig::parse("proxy.corp:8080").unwrap();
        assert_eq!(proxy.scheme, "http");
        assert_eq!(proxy.authority(), "proxy.corp:8080");
    }

    #[test]
    fn proxy_without_port_uses_scheme_default() {
        assert_eq!(ProxyConfig::parse("http://proxy.corp").unwrap().port, 80);
        assert_eq!(ProxyConfig::parse("https://proxy.corp").unwrap().port, 443);
    }

    #[test]
    fn proxy_rejects_bad_input() {
        assert!(ProxyConfig::parse("").is_err());
        assert!(ProxyConfig::parse("socks5://proxy.corp:1080").is_err());
        assert!(ProxyConfig::parse("http://").is_err());
    }

    #[test]
    fn resolve_prefers_explicit_then_env() {
        let env = |name: &str| match name {
            "http_proxy" => Some("http://lower:1".to_string()),
            "HTTP_PROXY" => Some("http://upper:2".to_string()),
            _ => None,
        };
        assert_eq!(
            resolve_proxy_url(Some("http://explicit:3"), env).as_deref(),
            Some("http://explicit:3")
        );
        assert_eq!(resolve_proxy_url(None, env).as_deref(), Some("http://lower:1"));
    }

    #[test]
    fn resolve_skips_empty_env_values() {
        let env = |name: &str| match name {
            "http_proxy" => Some(String::new()),
            "HTTP_PROXY" => Some("http://upper:2".to_string()),
            _ => None,
        };
        assert_eq!(resolve_proxy_url(None, env).as_deref(), Some("http://upper:2"));
        assert_eq!(resolve_proxy_url(None, |_| None), None);
    }
}
