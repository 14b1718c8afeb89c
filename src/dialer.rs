//! Outbound connections into the tailnet.
//!
//! The overlay client itself lives outside this crate. A [`Dialer`] is the only
//! thing the forwarders need from it: given `host:port`, produce a byte stream.
//! Two dialers ship here. [`DirectDialer`] uses host networking, which reaches the
//! tailnet when a kernel-mode tailscaled owns the routes. [`Socks5Dialer`] goes
//! through the SOCKS5 endpoint of a userspace tailscaled
//! (`tailscaled --tun=userspace-networking --socks5-server=...`).

use futures_util::future::BoxFuture;
use std::{io, net::IpAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::config::parse_host_port;
use crate::stream::BoxedStream;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Produces byte-stream connections to tailnet addresses. Implementations are
/// shared across every forwarding task and must not require locking.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy_addr: String,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
        }
    }

    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        let (host, port) = parse_host_port(address).map_err(invalid_input)?;

        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        stream.set_nodelay(true)?;

        stream.write_all(&[SOCKS_VERSION, 1, NO_AUTH]).await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice != [SOCKS_VERSION, NO_AUTH] {
            return Err(protocol_error(format!(
                "SOCKS5 proxy rejected no-auth negotiation (reply {choice:02x?})"
            )));
        }

        let request = connect_request(host, port)?;
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(protocol_error(format!("unexpected SOCKS version {}", head[0])));
        }
        if head[1] != 0x00 {
            return Err(io::Error::new(
                reply_error_kind(head[1]),
                format!("SOCKS5 connect to {address} failed: {}", reply_message(head[1])),
            ));
        }

        // Discard the bound address; the stream is ready once it is consumed.
        let bound_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => usize::from(stream.read_u8().await?),
            other => return Err(protocol_error(format!("unknown address type {other}"))),
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;

        debug!(proxy = %self.proxy_addr, target = %address, "SOCKS5 tunnel established");
        Ok(stream)
    }
}

impl Dialer for Socks5Dialer {
    fn dial<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move { Ok(Box::new(self.connect(address).await?) as BoxedStream) })
    }
}

/// Picks the dialer for the configured overlay access path.
#[must_use]
pub fn build_dialer(socks5_addr: Option<&str>) -> Arc<dyn Dialer> {
    match socks5_addr {
        Some(addr) => Arc::new(Socks5Dialer::new(addr)),
        None => Arc::new(DirectDialer),
    }
}

fn connect_request(host: &str, port: u16) -> io::Result<Vec<u8>> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| invalid_input(format!("host name too long: {host}")))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn reply_error_kind(code: u8) -> io::ErrorKind {
    match code {
        0x05 => io::ErrorKind::ConnectionRefused,
        0x03 | 0x04 => io::ErrorKind::HostUnreachable,
        0x06 => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    }
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
