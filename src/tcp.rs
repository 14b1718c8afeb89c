use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dialer::Dialer;
use crate::error::ForwardError;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client to tailnet target.
    Upstream,
    /// Tailnet target back to the local client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upstream => "to tailnet target",
            Self::Downstream => "from tailnet target",
        })
    }
}

/// Everything a TCP session needs, cloned into each accepted connection's task.
#[derive(Clone)]
pub struct TcpForwarder {
    dialer: Arc<dyn Dialer>,
    target: Arc<str>,
    dial_timeout: Duration,
    session_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        target: &str,
        dial_timeout: Duration,
        session_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            target: Arc::from(target),
            dial_timeout,
            session_timeout,
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forwards one accepted connection under the absolute session deadline.
    /// Both streams are dropped, and therefore closed, when this returns.
    pub async fn forward<L>(&self, local: L) -> Result<(), ForwardError>
    where
        L: AsyncRead + AsyncWrite + Unpin + Send,
    {
        timeout(
            self.session_timeout,
            forward_tcp(local, self.dialer.as_ref(), &self.target, self.dial_timeout),
        )
        .await
        .map_err(|_| ForwardError::SessionTimeout(self.session_timeout))?
    }
}

/// Dials `target` and pumps bytes both ways until both directions finish.
///
/// A failed dial drops `local`, closing it, and is never retried.
pub async fn forward_tcp<L>(
    local: L,
    dialer: &dyn Dialer,
    target: &str,
    dial_timeout: Duration,
) -> Result<(), ForwardError>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    let remote = match timeout(dial_timeout, dialer.dial(target)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(source)) => {
            return Err(ForwardError::Dial {
                address: target.to_string(),
                source: Arc::new(source),
            });
        }
        Err(_) => {
            return Err(ForwardError::DialTimeout {
                address: target.to_string(),
                timeout: dial_timeout,
            });
        }
    };
    debug!(target_addr = %target, "Connected to tailnet target");

    pump(local, remote).await
}

/// Copies `local -> remote` and `remote -> local` concurrently under one
/// cancellation scope. Returns the first error, if any.
pub async fn pump<L, R>(local: L, remote: R) -> Result<(), ForwardError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();
    let (mut local_reader, mut local_writer) = tokio::io::split(local);
    let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

    let (upstream, downstream) = tokio::join!(
        copy_half(&mut local_reader, &mut remote_writer, Direction::Upstream, &cancel),
        copy_half(&mut remote_reader, &mut local_writer, Direction::Downstream, &cancel),
    );

    let (sent, received) = (upstream?, downstream?);
    info!(bytes_sent = sent, bytes_received = received, "TCP session closed");
    Ok(())
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    cancel: &CancellationToken,
) -> Result<u64, ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        result = tokio::io::copy(reader, writer) => result,
        () = cancel.cancelled() => {
            debug!(%direction, "Copy cancelled by sibling failure");
            return Ok(0);
        }
    };

    match copied {
        Ok(bytes) => {
            // Half-close so the peer sees EOF while the other direction drains.
            if let Err(e) = writer.shutdown().await {
                debug!(%direction, error = %e, "Half-close not supported, skipping");
            }
            debug!(%direction, bytes, "Copy finished");
            Ok(bytes)
        }
        Err(source) => {
            cancel.cancel();
            Err(ForwardError::Copy {
                direction,
                source: Arc::new(source),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use crate::stream::BoxedStream;
    use futures_util::future::BoxFuture;
    use std::io;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::sleep,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    /// Starts TCP echo server on free port, returns its address
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0; 4096];
                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        addr
    }

    /// Returns a connected (client, server-side) socket pair on loopback.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// Finds an address nothing is listening on
    async fn closed_port_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    struct HangingDialer;

    impl Dialer for HangingDialer {
        fn dial<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
            Box::pin(futures_util::future::pending())
        }
    }

    fn forwarder(target: &str) -> TcpForwarder {
        TcpForwarder::new(
            Arc::new(DirectDialer),
            target,
            DEFAULT_DIAL_TIMEOUT,
            Duration::from_secs(30),
        )
    }

    mod byte_pump {
        use super::*;

        #[tokio::test]
        async fn forwards_bytes_in_order_both_ways() {
            let echo = start_echo_server().await;
            let (mut client, local) = socket_pair().await;
            let session = tokio::spawn(async move { forwarder(&echo).forward(local).await });

            let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();

            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, payload);

            timeout(TEST_TIMEOUT, session).await.unwrap().unwrap().unwrap();
        }

        #[tokio::test]
        async fn propagates_half_close_to_target() {
            let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target_addr = target.local_addr().unwrap().to_string();
            let (mut client, local) = socket_pair().await;
            tokio::spawn(async move { forwarder(&target_addr).forward(local).await });

            let (mut remote, _) = target.accept().await.unwrap();
            client.write_all(b"request").await.unwrap();
            client.shutdown().await.unwrap();

            // The target sees EOF while its own direction is still open.
            let mut received = Vec::new();
            timeout(TEST_TIMEOUT, remote.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, b"request");

            remote.write_all(b"late reply").await.unwrap();
            remote.shutdown().await.unwrap();

            let mut reply = Vec::new();
            timeout(TEST_TIMEOUT, client.read_to_end(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reply, b"late reply");
        }

        #[tokio::test]
        async fn concurrent_sessions_stay_isolated() {
            let echo = start_echo_server().await;
            let mut clients = Vec::new();

            for id in 0..8u8 {
                let (client, local) = socket_pair().await;
                let echo = echo.clone();
                tokio::spawn(async move { forwarder(&echo).forward(local).await });
                clients.push(tokio::spawn(async move {
                    let mut client = client;
                    let payload = vec![id; 16 * 1024];
                    let (mut reader, mut writer) = client.split();
                    let write = async {
                        for chunk in payload.chunks(1024) {
                            writer.write_all(chunk).await.unwrap();
                            sleep(Duration::from_millis(1)).await;
                        }
                        writer.shutdown().await.unwrap();
                    };
                    let mut received = Vec::new();
                    let read = reader.read_to_end(&mut received);
                    let ((), read) = tokio::join!(write, read);
                    read.unwrap();
                    assert_eq!(received, payload);
                }));
            }

            for client in clients {
                timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
            }
        }

        #[tokio::test]
        async fn pumps_scripted_streams() {
            let local = tokio_test::io::Builder::new().read(b"ping").build();
            let remote = tokio_test::io::Builder::new().write(b"ping").build();
            timeout(TEST_TIMEOUT, pump(local, remote))
                .await
                .unwrap()
                .unwrap();
        }

        #[tokio::test]
        async fn read_error_cancels_idle_sibling() {
            let local = tokio_test::io::Builder::new()
                .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
                .build();
            // The target side never sends anything, so only cancellation ends its copy.
            let (remote, _target) = tokio::io::duplex(64);

            let err = timeout(TEST_TIMEOUT, pump(local, remote))
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(
                err,
                ForwardError::Copy { direction: Direction::Upstream, ref source }
                    if source.kind() == io::ErrorKind::ConnectionReset
            ));
        }
    }

    mod dialing {
        use super::*;

        #[tokio::test]
        async fn dial_failure_closes_local_connection() {
            let target = closed_port_addr().await;
            let (mut client, local) = socket_pair().await;

            let err = forwarder(&target).forward(local).await.unwrap_err();
            assert!(matches!(err, ForwardError::Dial { ref address, .. } if *address == target));

            let mut buffer = [0u8; 8];
            let n = timeout(TEST_TIMEOUT, client.read(&mut buffer))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }

        #[tokio::test]
        async fn dial_is_bounded_by_timeout() {
            let (_client, local) = socket_pair().await;
            let err = forward_tcp(
                local,
                &HangingDialer,
                "100.64.0.9:22",
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ForwardError::DialTimeout { .. }));
        }

        #[tokio::test]
        async fn session_deadline_ends_idle_sessions() {
            let echo = start_echo_server().await;
            let (_client, local) = socket_pair().await;
            let forwarder = TcpForwarder::new(
                Arc::new(DirectDialer),
                &echo,
                DEFAULT_DIAL_TIMEOUT,
                Duration::from_millis(100),
            );

            let err = timeout(TEST_TIMEOUT, forwarder.forward(local))
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, ForwardError::SessionTimeout(_)));
        }
    }
}
