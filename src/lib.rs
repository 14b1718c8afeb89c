//! railtail
//!
//! Forwards a local listener to targets that are only reachable over a Tailscale
//! tailnet. Three strategies are available, picked once at startup: a raw TCP byte
//! pump to a fixed `host:port`, an HTTP reverse proxy to a fixed base URL, and a
//! general tailnet proxy that routes each request on its Host header.

pub mod config;
pub mod dialer;
pub mod error;
pub mod proxy;
pub mod server;
pub mod stream;
pub mod tailnet;
pub mod tcp;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types and functions
pub use config::{Cli, Config, ForwardingMode, Settings, Target, load_config};
pub use dialer::{Dialer, DirectDialer, Socks5Dialer, build_dialer};
pub use error::{ConfigError, ForwardError};
pub use proxy::{HttpForwarder, ProxyBody, error_response, strip_hop_headers};
pub use server::{HttpHandler, run, serve_http, serve_tcp};
pub use stream::{BoxedStream, StreamType};
pub use tailnet::{TailnetProxy, derive_target};
pub use tcp::{TcpForwarder, forward_tcp};
pub use tls::{TlsPolicy, load_tls_config};
pub use transport::HttpTransport;
