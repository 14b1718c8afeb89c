use anyhow::{Context, Result};
use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, Target};
use crate::dialer::Dialer;
use crate::proxy::{HttpForwarder, ProxyBody, error_response};
use crate::tailnet::TailnetProxy;
use crate::tcp::TcpForwarder;
use crate::transport::HttpTransport;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Request handler installed for the HTTP-family modes.
#[derive(Clone)]
pub enum HttpHandler {
    /// Every request goes to one base URL.
    Fixed {
        forwarder: HttpForwarder,
        target: Arc<str>,
    },
    /// Each request goes to the machine named by its Host header.
    Tailnet(TailnetProxy),
}

impl HttpHandler {
    #[tracing::instrument(
        name = "http_request",
        skip_all,
        fields(client_addr = %client_addr, method = %request.method(), path = %request.uri().path())
    )]
    pub async fn handle(&self, request: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        match self {
            Self::Fixed { forwarder, target } => {
                info!(target = %target, "Forwarding");
                match forwarder.forward(target, request, client_addr).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!(target = %target, error = %e, "Failed to forward HTTP request");
                        error_response(&e)
                    }
                }
            }
            // The listener never terminates TLS, so inbound requests are plain.
            Self::Tailnet(proxy) => proxy.handle(request, client_addr, false).await,
        }
    }
}

/// Installs the strategy for the resolved mode and runs until `shutdown` fires.
/// In-flight sessions are then given up to the session timeout to finish. Only
/// startup failures are returned; per-connection failures are logged.
pub async fn run(
    listener: TcpListener,
    settings: &Settings,
    dialer: Arc<dyn Dialer>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listen_addr = listener
        .local_addr()
        .context("Failed to get listener local address")?;
    let drain_timeout = settings.timeouts.session;

    let http_forwarder = |dialer: Arc<dyn Dialer>| -> Result<HttpForwarder> {
        let transport = HttpTransport::new(dialer, &settings.tls, settings.timeouts.dial)
            .context("Failed to build outbound HTTP transport")?;
        Ok(HttpForwarder::new(Arc::new(transport)).with_forwarded_for(settings.append_forwarded_for))
    };

    match &settings.target {
        Target::Tcp(target) => {
            info!(
                listen_addr = %listen_addr,
                target_addr = %target,
                "Running in TCP tunnel mode (no HTTP scheme detected in target)"
            );
            let forwarder = TcpForwarder::new(
                dialer,
                target,
                settings.timeouts.dial,
                settings.timeouts.session,
            );
            serve_tcp(listener, forwarder, shutdown, drain_timeout).await;
        }
        Target::Url { mode, base } => {
            info!(
                listen_addr = %listen_addr,
                target_addr = %base,
                mode = %mode,
                "Running in HTTP proxy mode"
            );
            let handler = HttpHandler::Fixed {
                forwarder: http_forwarder(dialer)?,
                target: Arc::from(base.as_str()),
            };
            serve_http(
                listener,
                handler,
                settings.timeouts.read_header,
                shutdown,
                drain_timeout,
            )
            .await;
        }
        Target::HostHeader => {
            info!(listen_addr = %listen_addr, "Running in tailnet proxy mode");
            let handler = HttpHandler::Tailnet(TailnetProxy::new(http_forwarder(dialer)?));
            serve_http(
                listener,
                handler,
                settings.timeouts.read_header,
                shutdown,
                drain_timeout,
            )
            .await;
        }
    }

    Ok(())
}

/// Accept loop for TCP mode: one tracked forwarding task per connection, no cap
/// on concurrent sessions. After `shutdown` fires, waits up to `drain_timeout`
/// for live sessions before returning.
pub async fn serve_tcp(
    listener: TcpListener,
    forwarder: TcpForwarder,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let sessions = TaskTracker::new();

    while let Some((stream, client_addr)) = next_connection(&listener, &shutdown).await {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client_addr = %client_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        sessions.spawn(tcp_session(forwarder.clone(), stream, client_addr));
    }

    info!("Listener shut down, no longer accepting TCP connections");
    drain(sessions, drain_timeout).await;
}

#[tracing::instrument(
    name = "tcp_session",
    skip_all,
    fields(client_addr = %client_addr, target = %forwarder.target())
)]
async fn tcp_session(forwarder: TcpForwarder, stream: TcpStream, client_addr: SocketAddr) {
    info!("Forwarding TCP connection");
    if let Err(e) = forwarder.forward(stream).await {
        error!(error = %e, "Forwarding failed");
    }
}

/// HTTP/1.1 server for the HTTP-family modes. Request headers must arrive within
/// `read_header_timeout`; there is no write timeout so long streaming responses
/// survive. On `shutdown` every connection finishes its in-flight request and
/// closes, bounded by `drain_timeout`.
pub async fn serve_http(
    listener: TcpListener,
    handler: HttpHandler,
    read_header_timeout: Duration,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let handler = Arc::new(handler);
    let connections = TaskTracker::new();

    while let Some((stream, client_addr)) = next_connection(&listener, &shutdown).await {
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            let service = service_fn(move |request| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(request, client_addr).await) }
            });

            let connection = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(read_header_timeout)
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                () = shutdown.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                debug!(client_addr = %client_addr, error = %e, "HTTP connection ended with error");
            }
        });
    }

    info!("Listener shut down, no longer accepting HTTP connections");
    drain(connections, drain_timeout).await;
}

/// Next accepted connection, or `None` once `shutdown` fires. Accept errors are
/// logged and retried after a capped exponential backoff.
async fn next_connection(
    listener: &TcpListener,
    shutdown: &CancellationToken,
) -> Option<(TcpStream, SocketAddr)> {
    let mut backoff = MIN_ACCEPT_BACKOFF;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => return Some(accepted),
                Err(e) => error!(error = %e, retry_in = ?backoff, "Failed to accept connection"),
            },
            () = shutdown.cancelled() => return None,
        }

        tokio::select! {
            () = sleep(backoff) => {}
            () = shutdown.cancelled() => return None,
        }
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_ACCEPT_BACKOFF)
}

async fn drain(tasks: TaskTracker, limit: Duration) {
    tasks.close();
    if tasks.is_empty() {
        return;
    }

    info!(in_flight = tasks.len(), "Waiting for in-flight sessions to finish");
    if timeout(limit, tasks.wait()).await.is_err() {
        warn!(in_flight = tasks.len(), "Drain deadline reached, abandoning remaining sessions");
    }
}
