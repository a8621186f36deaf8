//! Shadowsocks SIP003 plugin bootstrap
//!
//! When launched by a shadowsocks client or server the addresses come from
//! `SS_LOCAL_*` / `SS_REMOTE_*` and the mode from `SS_PLUGIN_OPTIONS`.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::{Mode, Options};

pub const SS_LOCAL_HOST: &str = "SS_LOCAL_HOST";
pub const SS_LOCAL_PORT: &str = "SS_LOCAL_PORT";
pub const SS_REMOTE_HOST: &str = "SS_REMOTE_HOST";
pub const SS_REMOTE_PORT: &str = "SS_REMOTE_PORT";
pub const SS_PLUGIN_OPTIONS: &str = "SS_PLUGIN_OPTIONS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Sip003Error {
    #[error("Missing environment variable {0}")]
    MissingVariable(&'static str),

    #[error("Invalid plugin options '{options}': {reason}")]
    InvalidOptions { options: String, reason: String },
}

/// Parsed `SS_PLUGIN_OPTIONS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOptions {
    Client {
        sni: Option<String>,
        cleartext: bool,
    },
    Server {
        /// `(cert, key)`, `None` for cleartext
        identity: Option<(PathBuf, PathBuf)>,
    },
}

impl PluginOptions {
    pub fn parse(options: &str) -> Result<Self, Sip003Error> {
        let invalid = |reason: &str| Sip003Error::InvalidOptions {
            options: options.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = options.split(':').collect();
        match parts.as_slice() {
            ["client"] => Ok(PluginOptions::Client {
                sni: None,
                cleartext: false,
            }),
            ["client", "cleartext"] => Ok(PluginOptions::Client {
                sni: None,
                cleartext: true,
            }),
            ["client", ""] => Err(invalid("empty server name")),
            ["client", sni] => Ok(PluginOptions::Client {
                sni: Some(sni.to_string()),
                cleartext: false,
            }),
            ["server", "cleartext"] => Ok(PluginOptions::Server { identity: None }),
            ["server", cert, key] if !cert.is_empty() && !key.is_empty() => {
                Ok(PluginOptions::Server {
                    identity: Some((PathBuf::from(cert), PathBuf::from(key))),
                })
            }
            ["server", ..] => Err(invalid("expected server:<cert>:<key> or server:cleartext")),
            _ => Err(invalid("mode must be client or server")),
        }
    }
}

/// Whether the process was started by a SIP003 host
pub fn is_plugin_mode() -> bool {
    std::env::var_os(SS_LOCAL_HOST).is_some()
}

/// Everything a SIP003 host hands the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sip003Arguments {
    pub local: String,
    pub remote: String,
    pub options: PluginOptions,
}

impl Sip003Arguments {
    pub fn from_env() -> Result<Self, Sip003Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Sip003Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(name).ok_or(Sip003Error::MissingVariable(name));

        let local = join_host_port(&var(SS_LOCAL_HOST)?, &var(SS_LOCAL_PORT)?);
        let remote = join_host_port(&var(SS_REMOTE_HOST)?, &var(SS_REMOTE_PORT)?);
        let options = PluginOptions::parse(&var(SS_PLUGIN_OPTIONS)?)?;

        Ok(Self {
            local,
            remote,
            options,
        })
    }

    /// The client listens where the shadowsocks client sends (SS_LOCAL) and
    /// dials the tunnel server (SS_REMOTE). The server listens on SS_REMOTE and
    /// forwards to the shadowsocks server on SS_LOCAL.
    pub fn into_options(self) -> Options {
        match self.options {
            PluginOptions::Client { sni, cleartext } => Options {
                mode: Some(Mode::Client),
                local: Some(self.local),
                remote: Some(self.remote),
                sni,
                cleartext: Some(cleartext),
                ..Default::default()
            },
            PluginOptions::Server { identity } => {
                let cleartext = identity.is_none();
                let (cert, key) = identity.unzip();
                Options {
                    mode: Some(Mode::Server),
                    local: Some(self.remote),
                    remote: Some(self.local),
                    cert,
                    key,
                    cleartext: Some(cleartext),
                    ..Default::default()
                }
            }
        }
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
