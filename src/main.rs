//! gun - TCP/UDP tunnel over a gRPC duplex stream
//!
//! The client listens for TCP and UDP locally and carries each connection or
//! UDP peer over its own gRPC stream. The server accepts those streams and
//! forwards them to one remote address.

mod config;
mod sip003;

use anyhow::{Context, Result};
use clap::Parser;
use gun_relay::{Client, RelayHandle, RelayResult, Server};
use gun_transport::{GrpcDialer, GrpcListener};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{Mode, Options, Settings};
use sip003::Sip003Arguments;

/// gun - TCP/UDP tunnel over gRPC
#[derive(Parser, Debug)]
#[command(name = "gun")]
#[command(about = "TCP/UDP tunnel over a gRPC duplex stream")]
#[command(version)]
#[command(long_about = r#"
gun carries TCP connections and UDP datagrams inside gRPC streams, optionally
over TLS, so the tunnel looks like ordinary gRPC traffic.

EXAMPLES:
  # Server: accept tunnels on 443, forward to a local service
  gun --mode server --local 0.0.0.0:443 --remote 127.0.0.1:8388 \
    --cert cert.pem --key key.pem

  # Client: listen on 1080 (tcp+udp), tunnel to the server
  gun --mode client --local 127.0.0.1:1080 --remote tunnel.example.com:443

  # Using a config file
  gun --config gun.yaml --log-level debug

When started as a shadowsocks plugin (SS_LOCAL_HOST is set), the addresses and
mode are read from the SIP003 environment instead.
"#)]
struct Args {
    /// Run as client or server
    #[arg(long, value_enum, env = "GUN_MODE")]
    mode: Option<Mode>,

    /// Address to listen on (host:port)
    #[arg(long, env = "GUN_LOCAL")]
    local: Option<String>,

    /// Client: tunnel server address. Server: address to forward to.
    #[arg(long, env = "GUN_REMOTE")]
    remote: Option<String>,

    /// Server certificate chain (PEM)
    #[arg(long, env = "GUN_CERT")]
    cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "GUN_KEY")]
    key: Option<PathBuf>,

    /// TLS server name override (client)
    #[arg(long, env = "GUN_SNI")]
    sni: Option<String>,

    /// Additional trusted root certificates (PEM, client)
    #[arg(long, env = "GUN_CA")]
    ca: Option<PathBuf>,

    /// Use HTTP/2 without TLS
    #[arg(long, env = "GUN_CLEARTEXT")]
    cleartext: bool,

    /// gRPC service name
    #[arg(long, env = "GUN_SERVICE_NAME")]
    service_name: Option<String>,

    /// UDP session idle timeout in seconds
    #[arg(long, env = "GUN_UDP_TIMEOUT")]
    udp_timeout: Option<u64>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_options(self) -> (Options, Option<PathBuf>) {
        let options = Options {
            mode: self.mode,
            local: self.local,
            remote: self.remote,
            cert: self.cert,
            key: self.key,
            sni: self.sni,
            ca: self.ca,
            cleartext: self.cleartext.then_some(true),
            service_name: self.service_name,
            udp_timeout: self.udp_timeout,
            log_level: self.log_level,
        };
        (options, self.config)
    }
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Merge command line, plugin environment and config file
fn load_options(args: Args) -> Result<Options> {
    let (mut options, config_path) = args.into_options();

    if sip003::is_plugin_mode() {
        let plugin = Sip003Arguments::from_env().context("Invalid SIP003 environment")?;
        options = plugin.into_options().or(options);
    }

    if let Some(path) = config_path {
        let file = Options::load(&path)?;
        options = options.or(file);
    }

    Ok(options)
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve {}", addr))?
        .next()
        .with_context(|| format!("No addresses found for {}", addr))
}

async fn run_client(settings: Settings) -> Result<()> {
    let grpc_config = settings.grpc_client_config()?;
    let dialer = GrpcDialer::new(settings.remote.clone(), Arc::new(grpc_config))
        .context("Failed to create tunnel dialer")?;
    info!(
        "Tunnel server: {} (sni {})",
        dialer.remote_addr(),
        dialer.server_name()
    );

    let local = resolve(&settings.local).await?;
    let client = Client::bind(local, Arc::new(dialer), settings.relay_config())
        .await
        .context("Failed to start client")?;

    let handle = client.handle();
    run_until_ctrl_c(handle, client.run()).await
}

async fn run_server(settings: Settings) -> Result<()> {
    let grpc_config = settings.grpc_server_config()?;
    let local = resolve(&settings.local).await?;
    let listener = GrpcListener::bind(local, Arc::new(grpc_config))
        .await
        .context("Failed to start tunnel listener")?;
    info!("Accepting tunnels on {}", listener.local_addr());

    let server = Server::new(listener, &settings.remote, settings.relay_config())
        .await
        .context("Failed to start server")?;

    let handle = server.handle();
    run_until_ctrl_c(handle, server.run()).await
}

async fn run_until_ctrl_c<F>(handle: RelayHandle, relay: F) -> Result<()>
where
    F: Future<Output = RelayResult<()>> + Send + 'static,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut relay_task = tokio::spawn(relay);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            handle.shutdown();
            relay_task
                .await
                .context("Relay task panicked")?
                .context("Relay error")?;
        }
        result = &mut relay_task => {
            match result {
                Ok(Ok(())) => info!("Relay stopped"),
                Ok(Err(e)) => {
                    error!("Relay error: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Relay task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let options = load_options(args).context("Failed to load configuration")?;

    let log_level = options
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&log_level)?;

    let settings = Settings::try_from(options).context("Invalid configuration")?;
    info!(
        "gun {} starting in {} mode ({} -> {})",
        env!("CARGO_PKG_VERSION"),
        settings.mode,
        settings.local,
        settings.remote
    );

    match settings.mode {
        Mode::Client => run_client(settings).await,
        Mode::Server => run_server(settings).await,
    }
}
