use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use log::{LevelFilter, debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

use ioproxy::settings::{APP_NAME, Settings};
use ioproxy::{
    ConnectOptions, ProxyConfig, RelayConfig, RelayServer, SharedQuery, Tunnel,
    UpstreamErrorPolicy, WebSocketClient,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("effective settings: {:?}", ctx.settings);

    match cli.command {
        Command::Relay(cmd) => async_relay(ctx, cmd),
        Command::Connect(cmd) => async_connect(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "ioproxy - real-time messaging connections through an HTTP proxy.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the local relay in the foreground
    Relay(RelayCommand),
    /// Open a messaging connection; stdin lines are sent, messages are printed
    Connect(ConnectCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct RelayCommand {
    /// Upstream proxy URL (default: config, then $http_proxy)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// What to do with the client request when the upstream fails
    #[arg(long, value_enum)]
    on_upstream_error: Option<UpstreamErrorPolicy>,
}

#[derive(Debug, Clone, Args)]
struct ConnectCommand {
    /// Destination URL (ws, wss, http or https)
    url: String,
    /// Upstream proxy URL (default: config, then $http_proxy)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,
    /// Extra handshake header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    config_path: Option<PathBuf>,
    settings: Settings,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_path = common.config.clone().or_else(Settings::default_path);
        let settings = Settings::load(config_path.as_deref()).context("loading configuration")?;
        Ok(Self {
            common,
            config_path,
            settings,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = match self.effective_log_level() {
            Some(LevelFilter::Off) => "off",
            Some(LevelFilter::Error) => "error",
            Some(LevelFilter::Warn) => "warn",
            Some(LevelFilter::Info) => "info",
            Some(LevelFilter::Debug) => "debug",
            Some(LevelFilter::Trace) => "trace",
            None => self.settings.logging.level.as_str(),
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || std::env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }
    }

    /// Level forced by command-line flags, if any.
    fn effective_log_level(&self) -> Option<LevelFilter> {
        if self.common.trace {
            Some(LevelFilter::Trace)
        } else if self.common.debug {
            Some(LevelFilter::Debug)
        } else {
            match self.common.verbose {
                0 => None,
                1 => Some(LevelFilter::Debug),
                _ => Some(LevelFilter::Trace),
            }
        }
    }

    fn proxy_override(&self, flag: Option<String>) -> Option<String> {
        flag.or_else(|| self.settings.proxy.url.clone())
    }
}

#[tokio::main]
async fn async_relay(ctx: RuntimeContext, cmd: RelayCommand) -> Result<()> {
    handle_relay(&ctx, cmd).await
}

#[tokio::main]
async fn async_connect(ctx: RuntimeContext, cmd: ConnectCommand) -> Result<()> {
    handle_connect(&ctx, cmd).await
}

async fn handle_relay(ctx: &RuntimeContext, cmd: RelayCommand) -> Result<()> {
    let mut listen = ctx
        .settings
        .relay
        .listen_addr()
        .context("parsing relay.host")?;
    if let Some(port) = cmd.port {
        listen.set_port(port);
    }

    let proxy_url = ioproxy::target::resolve_proxy_url(
        ctx.proxy_override(cmd.proxy).as_deref(),
        |name| std::env::var(name).ok(),
    );
    let proxy = proxy_url
        .as_deref()
        .map(ProxyConfig::parse)
        .transpose()
        .context("parsing proxy URL")?;
    if proxy.is_none() {
        warn!("No proxy configured; relay forwards straight to destinations");
    }

    let relay = RelayServer::start(RelayConfig {
        listen,
        proxy,
        on_upstream_error: cmd
            .on_upstream_error
            .unwrap_or(ctx.settings.relay.on_upstream_error),
        shared_query: SharedQuery::new(),
    })
    .await
    .context("starting relay")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down relay on {}", relay.local_addr());
    relay.stop().await;
    Ok(())
}

async fn handle_connect(ctx: &RuntimeContext, cmd: ConnectCommand) -> Result<()> {
    let listen = ctx
        .settings
        .relay
        .listen_addr()
        .context("parsing relay.host")?;
    let tunnel = Tunnel::builder(WebSocketClient::new())
        .relay_listen(listen)
        .on_upstream_error(ctx.settings.relay.on_upstream_error)
        .build();

    let proxy = ctx.proxy_override(cmd.proxy);
    tunnel
        .init(proxy.as_deref())
        .await
        .context("initializing tunnel")?;

    let mut options = ConnectOptions::default();
    for header in &cmd.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("header {header:?} is not in `Name: value` form"))?;
        options = options.with_header(name.trim(), value.trim());
    }

    let connection = tunnel
        .connect(&cmd.url, options)
        .await
        .with_context(|| format!("connecting to {}", cmd.url))?;
    info!("Connected to {}", cmd.url);

    let result = pump_stdio(connection).await;
    tunnel.shutdown().await;
    result
}

/// Send stdin lines as text messages and print whatever arrives.
async fn pump_stdio(connection: ioproxy::WsConnection) -> Result<()> {
    let (mut sink, mut stream) = connection.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) => sink.send(Message::Text(line.into())).await.context("sending message")?,
                None => {
                    stdin_open = false;
                    sink.send(Message::Close(None)).await.context("sending close")?;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(Message::Binary(data))) => println!("<{} bytes of binary data>", data.len()),
                Some(Ok(Message::Close(frame))) => {
                    info!("Connection closed by peer: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err).context("receiving message"),
                None => break,
            },
        }
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered =
                toml::to_string_pretty(&ctx.settings).context("serializing configuration")?;
            print!("{rendered}");
        }
        ConfigCommand::Path => match &ctx.config_path {
            Some(path) => println!("{}", path.display()),
            None => println!("(no config directory available)"),
        },
    }
    Ok(())
}
