//! Configuration management for criproxy.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/criproxy/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `CRIPROXY_`, nested keys
//!    separated by `__`, e.g. `CRIPROXY_LOGGING__LEVEL`)
//! 5. Command-line arguments

use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::builder::{ConfigBuilder, DefaultState};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::{BackendSpec, UnixConnector};
use crate::error::{ProxyError, Result};
use crate::namespace::Namespace;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const SYSTEM_CONFIG: &str = "/etc/criproxy/config.toml";

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "criproxy", version, about = "CRI proxy multiplexing several container runtimes")]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Unix socket to listen on, e.g. /run/criproxy.sock
    #[arg(long, value_name = "PATH")]
    pub listen: Option<PathBuf>,

    /// Runtime sockets, e.g. /var/run/dockershim.sock,alt:/var/run/another.sock
    #[arg(long, value_name = "[ID:]PATH,...")]
    pub connect: Option<String>,

    /// Streaming port of the primary runtime
    #[arg(long)]
    pub stream_port: Option<u16>,

    /// Streaming URL of the primary runtime (overrides --stream-port)
    #[arg(long, value_name = "URL")]
    pub stream_url: Option<String>,

    /// Backend connection timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub connection_timeout: Option<u64>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Additional tracing filter directives, e.g. criproxy::list=trace
    #[arg(long, env = "CRIPROXY_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Socket the proxy serves on
    pub listen: PathBuf,
    /// Backend list as `[id:]path` entries separated by commas
    pub connect: String,
    /// Streaming port used to build the stream URL
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Explicit stream URL
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_socket_poll_interval")]
    pub socket_poll_interval_ms: u64,
    /// Give up waiting for a missing socket after this many polls
    #[serde(default)]
    pub socket_poll_attempts: Option<u32>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level directive
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Extra filter directives
    #[serde(default)]
    pub filter: Option<String>,
    /// Log file, stderr when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            file: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder =
            Self::defaults().add_source(config::File::with_name(SYSTEM_CONFIG).required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CRIPROXY")
                .prefix_separator("_")
                .separator("__"),
        );

        Self::build(builder, args)
    }

    fn defaults() -> ConfigBuilder<DefaultState> {
        config::Config::builder().add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
    }

    fn build(builder: ConfigBuilder<DefaultState>, args: &Args) -> Result<Self> {
        let mut config: ProxyConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args);
        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.listen = listen.clone();
        }
        if let Some(connect) = &args.connect {
            self.connect = connect.clone();
        }
        if let Some(port) = args.stream_port {
            self.stream_port = port;
        }
        if let Some(url) = &args.stream_url {
            self.stream_url = Some(url.clone());
        }
        if let Some(timeout) = args.connection_timeout {
            self.connection_timeout_secs = timeout;
        }
        if let Some(filter) = &args.log_filter {
            self.logging.filter = Some(filter.clone());
        }
        if let Some(file) = &args.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    pub fn backends(&self) -> Result<Vec<BackendSpec>> {
        parse_backends(&self.connect)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn connector(&self) -> UnixConnector {
        UnixConnector::new(self.connection_timeout())
            .poll_interval(Duration::from_millis(self.socket_poll_interval_ms))
            .poll_attempts(self.socket_poll_attempts)
    }

    /// Base URL relative streaming URLs are resolved against.
    pub fn stream_base_url(&self) -> Result<Url> {
        match &self.stream_url {
            Some(raw) => {
                let url = Url::parse(raw)?;
                if !url.has_host() {
                    return Err(ProxyError::Config(format!("invalid stream url {:?}: no host", raw)));
                }
                Ok(url)
            }
            None => {
                let ip = node_ip().ok_or_else(|| {
                    ProxyError::Config("can't get stream url: unable to determine node address".to_string())
                })?;
                stream_url_for(ip, self.stream_port)
            }
        }
    }
}

/// Parses a comma-separated `[id:]path` backend list.
pub fn parse_backends(connect: &str) -> Result<Vec<BackendSpec>> {
    connect
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, path)) => Ok(BackendSpec::new(Namespace::named(id)?, path)),
            None => Ok(BackendSpec::new(Namespace::primary(), entry)),
        })
        .collect()
}

fn stream_url_for(ip: IpAddr, port: u16) -> Result<Url> {
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    Ok(Url::parse(&format!("http://{}:{}", host, port))?)
}

/// Address of the interface holding the default route.
///
/// Connecting a UDP socket sends nothing; it only selects the source
/// address the kernel would route from.
fn node_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

fn default_stream_port() -> u16 {
    11250
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_socket_poll_interval() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}
