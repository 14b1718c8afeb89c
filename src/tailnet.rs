use bytes::Bytes;
use hyper::{Request, Response, body::Body, header::HOST};
use std::{error::Error as StdError, net::SocketAddr};
use tracing::{error, info};

use crate::error::ForwardError;
use crate::proxy::{HttpForwarder, ProxyBody, error_response};

/// General tailnet proxy: needs no configured target, each request goes to the
/// machine named in its Host header (e.g. `grafana.tailnet.ts.net:3000`).
#[derive(Clone)]
pub struct TailnetProxy {
    forwarder: HttpForwarder,
}

impl TailnetProxy {
    #[must_use]
    pub fn new(forwarder: HttpForwarder) -> Self {
        Self { forwarder }
    }

    /// Serves one request, answering failures with `400`/`502`.
    #[tracing::instrument(
        name = "tailnet_request",
        skip_all,
        fields(host = %request_host(&request), inbound_tls = inbound_tls)
    )]
    pub async fn handle<B>(
        &self,
        request: Request<B>,
        client_addr: SocketAddr,
        inbound_tls: bool,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        match self.forward(request, client_addr, inbound_tls).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Failed to forward tailnet request");
                error_response(&e)
            }
        }
    }

    pub async fn forward<B>(
        &self,
        request: Request<B>,
        client_addr: SocketAddr,
        inbound_tls: bool,
    ) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let host = request_host(&request);
        let target = derive_target(host, inbound_tls)?;

        info!(target_url = %target, "Tailnet proxy forwarding");

        self.forwarder.forward(&target, request, client_addr).await
    }
}

/// Host the client asked for: the Host header, or the authority of an
/// absolute-form request line when the header is absent.
#[must_use]
pub fn request_host<B>(request: &Request<B>) -> &str {
    match request.headers().get(HOST) {
        Some(value) => value.to_str().unwrap_or_default().trim(),
        None => request.uri().authority().map_or("", |a| a.as_str()),
    }
}

/// Base URL for `host`. The scheme follows the inbound connection: `https` when
/// it arrived over TLS, `http` otherwise.
pub fn derive_target(host: &str, inbound_tls: bool) -> Result<String, ForwardError> {
    if host.is_empty() {
        return Err(ForwardError::MissingHost);
    }
    let scheme = if inbound_tls { "https://" } else { "http://" };
    Ok(format!("{scheme}{host}"))
}
