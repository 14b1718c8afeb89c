use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::{
    fmt, fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ConfigError;
use crate::tls::TlsPolicy;

/// Command line flags. Every flag falls back to an environment variable and, when
/// neither is present, to the config file and then to the built-in default.
#[derive(Debug, Default, Parser)]
#[command(name = "railtail", version, about)]
pub struct Cli {
    /// Path to an optional TOML config file.
    #[arg(long, env = "RAILTAIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// IP address to listen on.
    #[arg(long, env = "LISTEN_IP")]
    pub listen_ip: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "LISTEN_PORT")]
    pub listen_port: Option<u32>,

    /// Target tailnet address (e.g. 100.x.x.x:port or http://100.x.x.x:port).
    #[arg(long, env = "TARGET_ADDR")]
    pub target_addr: Option<String>,

    /// Operate as a general tailnet proxy routing on the Host header. TARGET_ADDR is
    /// ignored when set.
    #[arg(long, env = "PROXY_MODE", num_args = 0..=1, default_missing_value = "true")]
    pub proxy_mode: Option<bool>,

    /// Skip TLS certificate verification for HTTPS targets.
    #[arg(long, env = "INSECURE_SKIP_VERIFY", num_args = 0..=1, default_missing_value = "true")]
    pub insecure_skip_verify: Option<bool>,

    /// SOCKS5 endpoint of a userspace tailscaled (e.g. localhost:1055). Outbound
    /// connections use host networking when unset.
    #[arg(long, env = "TS_SOCKS5_ADDR")]
    pub socks5_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_ip: String,
    pub listen_port: u32,
    pub target_addr: Option<String>,
    pub proxy_mode: bool,
    pub insecure_skip_verify: bool,
    pub ca_file: Option<PathBuf>,
    pub socks5_addr: Option<String>,
    pub append_forwarded_for: bool,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dial_secs: u64,
    pub session_secs: u64,
    pub read_header_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: "::".to_string(),
            listen_port: 8080,
            target_addr: None,
            proxy_mode: false,
            insecure_skip_verify: true,
            ca_file: None,
            socks5_addr: None,
            append_forwarded_for: false,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: 10,
            session_secs: 300,
            read_header_secs: 5,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
}

impl Config {
    /// Builds the effective config: file (if any), then flags and environment.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ip) = &cli.listen_ip {
            self.listen_ip.clone_from(ip);
        }
        if let Some(port) = cli.listen_port {
            self.listen_port = port;
        }
        if let Some(target) = &cli.target_addr {
            self.target_addr = Some(target.clone());
        }
        if let Some(proxy_mode) = cli.proxy_mode {
            self.proxy_mode = proxy_mode;
        }
        if let Some(skip) = cli.insecure_skip_verify {
            self.insecure_skip_verify = skip;
        }
        if let Some(socks5) = &cli.socks5_addr {
            self.socks5_addr = Some(socks5.clone());
        }
    }

    /// Validates the config and resolves the forwarding mode. All validation
    /// failures are returned together.
    pub fn resolve(&self) -> Result<Settings, Vec<ConfigError>> {
        let mut errors = Vec::new();

        let target = match resolve_target(self.target_addr.as_deref(), self.proxy_mode) {
            Ok(target) => Some(target),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        let listen_addr = match listen_addr(&self.listen_ip, self.listen_port) {
            Ok(addr) => Some(addr),
            Err(e) => {
                errors.push(e);
                None
            }
        };

        if let Some(socks5) = self.socks5_addr.as_deref() {
            if let Err(reason) = parse_host_port(socks5) {
                errors.push(ConfigError::InvalidSocks5Addr {
                    addr: socks5.to_string(),
                    reason,
                });
            }
        }

        match (target, listen_addr) {
            (Some(target), Some(listen_addr)) if errors.is_empty() => Ok(Settings {
                listen_addr,
                target,
                tls: TlsPolicy {
                    insecure_skip_verify: self.insecure_skip_verify,
                    ca_file: self.ca_file.clone(),
                },
                socks5_addr: self.socks5_addr.clone(),
                append_forwarded_for: self.append_forwarded_for,
                timeouts: Timeouts {
                    dial: Duration::from_secs(self.timeouts.dial_secs),
                    session: Duration::from_secs(self.timeouts.session_secs),
                    read_header: Duration::from_secs(self.timeouts.read_header_secs),
                },
            }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    Tcp,
    Http,
    Https,
    TailnetProxy,
}

impl fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Https => "https",
            Self::TailnetProxy => "tailnet_proxy",
        })
    }
}

/// Where forwarded traffic goes. Read-only once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Raw TCP to a `host:port` on the tailnet.
    Tcp(String),
    /// HTTP(S) to a fixed base URL, stored without a trailing slash.
    Url { mode: ForwardingMode, base: String },
    /// Derived per request from the Host header.
    HostHeader,
}

impl Target {
    #[must_use]
    pub fn mode(&self) -> ForwardingMode {
        match self {
            Self::Tcp(_) => ForwardingMode::Tcp,
            Self::Url { mode, .. } => *mode,
            Self::HostHeader => ForwardingMode::TailnetProxy,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Url { base, .. } => f.write_str(base),
            Self::HostHeader => f.write_str("<host header>"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub dial: Duration,
    pub session: Duration,
    pub read_header: Duration,
}

/// Validated, immutable process settings handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub target: Target,
    pub tls: TlsPolicy,
    pub socks5_addr: Option<String>,
    pub append_forwarded_for: bool,
    pub timeouts: Timeouts,
}

impl Settings {
    #[must_use]
    pub fn mode(&self) -> ForwardingMode {
        self.target.mode()
    }
}

/// Proxy mode wins over any target. Otherwise the scheme of the target picks
/// HTTP, HTTPS or (no recognised scheme) TCP.
pub fn resolve_target(target_addr: Option<&str>, proxy_mode: bool) -> Result<Target, ConfigError> {
    if proxy_mode {
        return Ok(Target::HostHeader);
    }
    let addr = match target_addr {
        Some(addr) if !addr.is_empty() => addr,
        _ => return Err(ConfigError::MissingTarget),
    };

    let (mode, rest) = match addr.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => (ForwardingMode::Http, rest),
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => {
            (ForwardingMode::Https, rest)
        }
        _ => {
            parse_host_port(addr).map_err(|reason| ConfigError::InvalidTcpTarget {
                addr: addr.to_string(),
                reason,
            })?;
            return Ok(Target::Tcp(addr.to_string()));
        }
    };

    let invalid = |reason: String| ConfigError::InvalidUrlTarget {
        addr: addr.to_string(),
        reason,
    };
    let base = format!("{mode}://{}", rest.trim_end_matches('/'));
    let uri: http::Uri = base
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid("missing host in URL".to_string()));
    }

    Ok(Target::Url { mode, base })
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_host_port(addr: &str) -> Result<(&str, u16), String> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| "missing ']' in address".to_string())?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        (host, port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| "missing port in address".to_string())?;
        if host.contains(':') {
            return Err("too many colons in address".to_string());
        }
        (host, port)
    };

    if host.is_empty() {
        return Err("missing host in address".to_string());
    }
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port '{port}': {e}"))?;
    Ok((host, port))
}

fn listen_addr(ip: &str, port: u32) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ConfigError::InvalidListenIp(ip.to_string()))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ConfigError::InvalidListenPort(port))?;
    Ok(SocketAddr::new(ip, port))
}
