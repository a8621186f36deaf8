//! Run configuration: command line, environment and YAML file

use anyhow::{Context, Result};
use gun_proto::DEFAULT_SERVICE_NAME;
use gun_relay::RelayConfig;
use gun_transport::GrpcConfig;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// Partial configuration from one source.
///
/// The same shape is read from the YAML file and built from the command
/// line, then merged with [`Options::or`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct Options {
    pub mode: Option<Mode>,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub sni: Option<String>,
    pub ca: Option<PathBuf>,
    pub cleartext: Option<bool>,
    pub service_name: Option<String>,
    /// Seconds
    pub udp_timeout: Option<u64>,
    pub log_level: Option<String>,
}

impl Options {
    /// Load options from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document deserializes as null
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Fill every unset field from `lower`
    pub fn or(self, lower: Options) -> Options {
        Options {
            mode: self.mode.or(lower.mode),
            local: self.local.or(lower.local),
            remote: self.remote.or(lower.remote),
            cert: self.cert.or(lower.cert),
            key: self.key.or(lower.key),
            sni: self.sni.or(lower.sni),
            ca: self.ca.or(lower.ca),
            cleartext: self.cleartext.or(lower.cleartext),
            service_name: self.service_name.or(lower.service_name),
            udp_timeout: self.udp_timeout.or(lower.udp_timeout),
            log_level: self.log_level.or(lower.log_level),
        }
    }
}

/// Validated configuration for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mode: Mode,
    /// Address to listen on
    pub local: String,
    /// Client: tunnel server address. Server: address to forward to.
    pub remote: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub sni: Option<String>,
    pub ca: Option<PathBuf>,
    pub cleartext: bool,
    pub service_name: String,
    pub udp_timeout: Duration,
}

impl TryFrom<Options> for Settings {
    type Error = anyhow::Error;

    fn try_from(options: Options) -> Result<Self> {
        let mode = options
            .mode
            .ok_or_else(|| anyhow::anyhow!("Mode is required (use --mode client|server)"))?;

        let local = options
            .local
            .ok_or_else(|| anyhow::anyhow!("Local address is required (use --local or config file)"))?;
        validate_address(&local, "local")?;

        let remote = options.remote.ok_or_else(|| {
            anyhow::anyhow!("Remote address is required (use --remote or config file)")
        })?;
        validate_address(&remote, "remote")?;

        let cleartext = options.cleartext.unwrap_or(false);
        if mode == Mode::Server && !cleartext && (options.cert.is_none() || options.key.is_none()) {
            anyhow::bail!("Server mode needs --cert and --key unless --cleartext is set");
        }

        let udp_timeout = options.udp_timeout.unwrap_or(120);
        if udp_timeout == 0 {
            anyhow::bail!("UDP timeout must be at least 1 second");
        }

        Ok(Settings {
            mode,
            local,
            remote,
            cert: options.cert,
            key: options.key,
            sni: options.sni.filter(|s| !s.is_empty()),
            ca: options.ca,
            cleartext,
            service_name: options
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            udp_timeout: Duration::from_secs(udp_timeout),
        })
    }
}

impl Settings {
    /// Channel configuration for the client dialer
    pub fn grpc_client_config(&self) -> Result<GrpcConfig> {
        let mut config = GrpcConfig::client_default().with_service_name(&self.service_name);
        if self.cleartext {
            config = config.with_cleartext();
        }
        if let Some(sni) = &self.sni {
            config = config.with_server_name(sni);
        }
        if let Some(ca) = &self.ca {
            config = config
                .with_root_certs_pem(ca)
                .with_context(|| format!("Failed to load CA file: {}", ca.display()))?;
        }
        Ok(config)
    }

    /// Channel configuration for the server listener
    pub fn grpc_server_config(&self) -> Result<GrpcConfig> {
        let config = match (&self.cert, &self.key) {
            _ if self.cleartext => GrpcConfig::server_cleartext(),
            (Some(cert), Some(key)) => GrpcConfig::server_from_pem(cert, key)
                .context("Failed to load server certificate")?,
            _ => anyhow::bail!("Server certificate and key are required unless cleartext"),
        };
        Ok(config.with_service_name(&self.service_name))
    }

    pub fn relay_config(&self) -> RelayConfig {
        let reap_interval = RelayConfig::default().reap_interval.min(self.udp_timeout);
        RelayConfig::default()
            .with_udp_timeout(self.udp_timeout)
            .with_reap_interval(reap_interval)
    }
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}
