//! Layered configuration: defaults, optional TOML file, then `IOPROXY__*`
//! environment variables.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::relay::{DEFAULT_RELAY_PORT, UpstreamErrorPolicy};

pub const APP_NAME: &str = "ioproxy";

/// Prefix for environment overrides, e.g. `IOPROXY__RELAY__PORT=61500`.
pub const ENV_PREFIX: &str = "IOPROXY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub relay: RelaySettings,
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub on_upstream_error: UpstreamErrorPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_RELAY_PORT,
            on_upstream_error: UpstreamErrorPolicy::default(),
        }
    }
}

impl RelaySettings {
    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Upstream proxy URL. Falls back to `http_proxy` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Settings {
    /// Default config file location, `<config dir>/ioproxy/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
    }

    /// Load settings from `path` (optional file) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("logging.level", defaults.logging.level)?
            .set_default("relay.host", defaults.relay.host)?
            .set_default("relay.port", i64::from(defaults.relay.port))?
            .set_default("relay.on_upstream_error", "hold")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
