use anyhow::Result;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, combinators::UnsyncBoxBody};
use hyper::{
    Request, Response, Uri,
    body::{Body, Incoming},
    rt::{Read, ReadBufCursor, Write},
};
use hyper_util::{
    client::legacy::{
        Client,
        connect::{Connected, Connection},
    },
    rt::{TokioExecutor, TokioIo, TokioTimer},
};
use rustls::pki_types::ServerName;
use std::{
    error::Error as StdError,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::debug;

use crate::dialer::Dialer;
use crate::error::ForwardError;
use crate::stream::StreamType;
use crate::tls::{TlsPolicy, load_tls_config};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Request body type accepted by the pooled client.
pub type OutboundBody = UnsyncBoxBody<Bytes, Box<dyn StdError + Send + Sync>>;

/// Sends HTTP/1.1 requests through the overlay dialer, keeping idle upstream
/// connections for reuse per scheme and authority. Built once at startup and
/// shared read-only by every request.
pub struct HttpTransport {
    client: Client<OverlayConnector, OutboundBody>,
}

impl HttpTransport {
    pub fn new(dialer: Arc<dyn Dialer>, policy: &TlsPolicy, dial_timeout: Duration) -> Result<Self> {
        let connector = OverlayConnector {
            dialer,
            tls: TlsConnector::from(Arc::new(load_tls_config(policy)?)),
            dial_timeout,
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);
        Ok(Self { client })
    }

    /// Performs one exchange. `request` must carry an absolute `http` or `https`
    /// URI; it is sent in origin form.
    pub async fn round_trip<B>(&self, request: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let request: Request<OutboundBody> =
            request.map(|body| body.map_err(Into::into).boxed_unsync());
        Ok(self.client.request(request).await?)
    }
}

/// Opens upstream connections for the pooled client: dial through the overlay,
/// then wrap in TLS for `https`. Dial and handshake share the dial timeout.
#[derive(Clone)]
struct OverlayConnector {
    dialer: Arc<dyn Dialer>,
    tls: TlsConnector,
    dial_timeout: Duration,
}

impl Service<Uri> for OverlayConnector {
    type Response = UpstreamConnection;
    type Error = ForwardError;
    type Future = BoxFuture<'static, Result<UpstreamConnection, ForwardError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            match timeout(connector.dial_timeout, connector.connect(&uri)).await {
                Ok(stream) => Ok(UpstreamConnection(TokioIo::new(stream?))),
                Err(_) => Err(ForwardError::DialTimeout {
                    address: uri.authority().map_or_else(String::new, ToString::to_string),
                    timeout: connector.dial_timeout,
                }),
            }
        })
    }
}

impl OverlayConnector {
    async fn connect(&self, uri: &Uri) -> Result<StreamType, ForwardError> {
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            other => {
                return Err(ForwardError::InvalidTarget(format!(
                    "unsupported scheme {other:?} in {uri}"
                )));
            }
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ForwardError::InvalidTarget(format!("missing host in {uri}")))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let address = format!("{host}:{port}");

        let stream = self
            .dialer
            .dial(&address)
            .await
            .map_err(|source| ForwardError::Dial {
                address: address.clone(),
                source: Arc::new(source),
            })?;

        let stream = if https {
            // IP literals become IP server names, for which no SNI is sent.
            let name = host.trim_start_matches('[').trim_end_matches(']');
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|e| ForwardError::InvalidTarget(format!("invalid TLS server name {name}: {e}")))?;
            let tls = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|source| ForwardError::Tls {
                    host: name.to_string(),
                    source: Arc::new(source),
                })?;
            StreamType::Tls(Box::new(tls))
        } else {
            StreamType::Plain(stream)
        };

        debug!(address = %address, tls = stream.is_tls(), "Connected to upstream");
        Ok(stream)
    }
}

/// An upstream stream as seen by the pooled client.
struct UpstreamConnection(TokioIo<StreamType>);

impl Connection for UpstreamConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for UpstreamConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for UpstreamConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}
