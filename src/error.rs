use http::StatusCode;
use hyper_util::client::legacy;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;

use crate::tcp::Direction;

/// Terminal cause of a single forwarded session or request. Sources are shared so a
/// connect failure raised inside the pooled client can be handed back unchanged.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("timed out dialing {address} after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("failed to copy data {direction}: {source}")]
    Copy {
        direction: Direction,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("session exceeded its {0:?} deadline")]
    SessionTimeout(Duration),

    #[error("invalid target URL: {0}")]
    InvalidTarget(String),

    #[error("no Host header provided")]
    MissingHost,

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("upstream exchange failed: {0}")]
    Transport(#[source] Arc<legacy::Error>),
}

impl From<legacy::Error> for ForwardError {
    /// Recovers the connector's own error when the exchange failed while
    /// connecting; anything else is a transport failure.
    fn from(err: legacy::Error) -> Self {
        let cause = std::error::Error::source(&err).and_then(|s| s.downcast_ref::<Self>());
        match cause {
            Some(cause) => cause.clone(),
            None => Self::Transport(Arc::new(err)),
        }
    }
}

impl ForwardError {
    /// Status code reported to HTTP clients when this error ends a request.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHost => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A single configuration validation failure. Validation reports every failure it
/// finds rather than stopping at the first one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TARGET_ADDR is required when not in proxy mode (or use --proxy-mode)")]
    MissingTarget,

    #[error("target-addr is invalid for TCP mode ('{addr}'): {reason}. Expected host:port")]
    InvalidTcpTarget { addr: String, reason: String },

    #[error("target-addr is invalid ('{addr}'): {reason}")]
    InvalidUrlTarget { addr: String, reason: String },

    #[error("listen-port is invalid: {0}: port must be between 1 and 65535")]
    InvalidListenPort(u32),

    #[error("listen-ip is invalid: {0}")]
    InvalidListenIp(String),

    #[error("socks5-addr is invalid ('{addr}'): {reason}. Expected host:port")]
    InvalidSocks5Addr { addr: String, reason: String },
}
