//! Connector: decides per connection whether to go direct or through the relay.

use std::net::SocketAddr;

use log::{debug, info};
use tokio::sync::Mutex;
use url::form_urlencoded;

use crate::client::{ConnectOptions, MessagingClient};
use crate::error::TunnelResult;
use crate::query::{QueryMap, SharedQuery};
use crate::relay::{RelayConfig, RelayServer, UpstreamErrorPolicy, default_relay_addr};
use crate::target::{DestinationTarget, ProxyConfig, resolve_proxy_url};

/// Environment lookup used for proxy discovery.
pub type EnvLookup = fn(&str) -> Option<String>;

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Default)]
struct RelayState {
    initialized: bool,
    relay: Option<RelayServer>,
}

/// Opens messaging connections, tunneling them through a local relay when a
/// proxy is configured.
///
/// A tunnel owns at most one relay at a time. Re-initializing it stops the
/// current relay before a new one binds the same port.
pub struct Tunnel<C = crate::client::WebSocketClient> {
    client: C,
    relay_listen: SocketAddr,
    on_upstream_error: UpstreamErrorPolicy,
    env: EnvLookup,
    shared_query: SharedQuery,
    state: Mutex<RelayState>,
}

/// Builder for [`Tunnel`].
pub struct TunnelBuilder<C> {
    client: C,
    relay_listen: SocketAddr,
    on_upstream_error: UpstreamErrorPolicy,
    env: EnvLookup,
}

impl<C: MessagingClient> TunnelBuilder<C> {
    /// Address the relay binds. Defaults to `127.0.0.1:61423`.
    pub fn relay_listen(mut self, addr: SocketAddr) -> Self {
        self.relay_listen = addr;
        self
    }

    pub fn on_upstream_error(mut self, policy: UpstreamErrorPolicy) -> Self {
        self.on_upstream_error = policy;
        self
    }

    /// Replace the process environment for proxy discovery.
    pub fn env_lookup(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn build(self) -> Tunnel<C> {
        Tunnel {
            client: self.client,
            relay_listen: self.relay_listen,
            on_upstream_error: self.on_upstream_error,
            env: self.env,
            shared_query: SharedQuery::new(),
            state: Mutex::new(RelayState::default()),
        }
    }
}

impl<C: MessagingClient> Tunnel<C> {
    pub fn new(client: C) -> Self {
        Self::builder(client).build()
    }

    pub fn builder(client: C) -> TunnelBuilder<C> {
        TunnelBuilder {
            client,
            relay_listen: default_relay_addr(),
            on_upstream_error: UpstreamErrorPolicy::default(),
            env: process_env,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// (Re)initialize the relay.
    ///
    /// Any running relay is stopped first. The proxy comes from `proxy_url`,
    /// else from `http_proxy`/`HTTP_PROXY`. Without either, no relay runs and
    /// connections go direct.
    pub async fn init(&self, proxy_url: Option<&str>) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state, proxy_url).await
    }

    /// The tunnel counts as initialized only once this succeeds.
    async fn init_locked(&self, state: &mut RelayState, proxy_url: Option<&str>) -> TunnelResult<()> {
        state.initialized = false;

        if let Some(relay) = state.relay.take() {
            relay.stop().await;
        }

        let Some(raw) = resolve_proxy_url(proxy_url, self.env) else {
            info!("Direct connection (no proxy defined)");
            state.initialized = true;
            return Ok(());
        };

        let proxy = ProxyConfig::parse(&raw)?;
        let relay = RelayServer::start(RelayConfig {
            listen: self.relay_listen,
            proxy: Some(proxy),
            on_upstream_error: self.on_upstream_error,
            shared_query: self.shared_query.clone(),
        })
        .await?;
        info!("Proxy: {}", raw);

        state.relay = Some(relay);
        state.initialized = true;
        Ok(())
    }

    /// Open a messaging connection to `destination_url`.
    ///
    /// In direct mode the URL goes to the client untouched. Otherwise the
    /// client connects to the local relay with the destination encoded in the
    /// query, and `force_new_connection` is set.
    pub async fn connect(
        &self,
        destination_url: &str,
        mut options: ConnectOptions,
    ) -> TunnelResult<C::Connection> {
        let destination = DestinationTarget::parse(destination_url)?;
        self.shared_query.replace(destination.query.clone());

        let relay_port = {
            let mut state = self.state.lock().await;
            if !state.initialized {
                self.init_locked(&mut state, None).await?;
            }
            state.relay.as_ref().map(|relay| relay.local_addr().port())
        };

        let Some(relay_port) = relay_port else {
            debug!("Connecting directly to {}", destination_url);
            return self.client.connect(destination_url, options).await;
        };

        options.force_new_connection = true;
        if options.path.is_none() {
            options.path = Some(destination.path.clone());
        }
        let url = relay_url(relay_port, &destination);
        debug!("Tunneling {} through {}", destination_url, url);
        self.client.connect(&url, options).await
    }

    /// Stop the relay, if any, and forget the initialization.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(relay) = state.relay.take() {
            relay.stop().await;
        }
        state.initialized = false;
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    /// Bound address of the running relay.
    pub async fn relay_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .relay
            .as_ref()
            .map(RelayServer::local_addr)
    }

    /// Current merged query set shared by all tunneled requests.
    pub fn shared_query(&self) -> QueryMap {
        self.shared_query.snapshot()
    }
}

/// URL of the local relay for `destination`.
pub fn relay_url(relay_port: u16, destination: &DestinationTarget) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("protocol", destination.relay_protocol())
        .append_pair("hostname", &destination.hostname)
        .append_pair("port", &destination.port.to_string())
        .finish();
    format!("http://localhost:{relay_port}/?{query}")
}
