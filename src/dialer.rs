//! Connector that always dials one pinned backend address.
//!
//! External hostnames handed out by the allocator have no DNS record that
//! leads to the backend, so the proxy never resolves the request authority.
//! [`StaticDialer`] ignores whatever address it is asked for and connects to
//! its [`ProxyTarget`] instead.
//!
//! Each dialed connection gets a watcher task. When the [`DialContext`]
//! deadline passes or its cancellation token fires, the watcher closes the
//! connection and any read or write blocked on it returns an error.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};
use tracing::debug;

/// The fixed `ip:port` a proxy connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTarget {
    pub ip: IpAddr,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Deadline and cancellation governing one dialed connection.
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl DialContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Dials a [`ProxyTarget`] regardless of the requested address.
///
/// Also usable as a `hyper_util` connector through its
/// `tower::Service<Uri>` impl.
#[derive(Debug, Clone)]
pub struct StaticDialer {
    target: ProxyTarget,
    connect_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl StaticDialer {
    pub fn new(target: ProxyTarget) -> Self {
        Self {
            target,
            connect_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound the TCP handshake (not the lifetime of the connection).
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Close every connection this dialer has opened once `token` fires.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn target(&self) -> ProxyTarget {
        self.target
    }

    /// Connect to the pinned target. `_requested` is ignored.
    pub async fn dial(&self, ctx: &DialContext, _requested: &str) -> io::Result<DialedConn> {
        if ctx.cancel.is_cancelled() {
            return Err(canceled());
        }

        let addr = self.target.socket_addr();
        let handshake_deadline = match (ctx.deadline, self.connect_timeout) {
            (Some(d), Some(t)) => Some(d.min(Instant::now() + t)),
            (Some(d), None) => Some(d),
            (None, Some(t)) => Some(Instant::now() + t),
            (None, None) => None,
        };

        let connect = async {
            match handshake_deadline {
                Some(d) => tokio::time::timeout_at(d, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out"))
                    })?,
                None => TcpStream::connect(addr).await,
            }
        };

        let stream = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(canceled()),
            res = connect => res?,
        };
        let _ = stream.set_nodelay(true);
        debug!(target = %addr, "dialed static target");

        Ok(DialedConn::watch(stream, ctx))
    }
}

impl tower::Service<Uri> for StaticDialer {
    type Response = TokioIo<DialedConn>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move {
            let ctx = DialContext::new().with_cancel(dialer.cancel.child_token());
            dialer.dial(&ctx, &uri.to_string()).await.map(TokioIo::new)
        })
    }
}

/// A TCP connection that fails all further I/O once its context is done.
pub struct DialedConn {
    stream: TcpStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    is_closed: bool,
    // stops the watcher when the connection is dropped first
    _release: DropGuard,
}

impl DialedConn {
    fn watch(stream: TcpStream, ctx: &DialContext) -> Self {
        let closed = CancellationToken::new();
        let released = CancellationToken::new();

        let cancel = ctx.cancel.clone();
        let deadline = ctx.deadline;
        let closer = closed.clone();
        let release = released.clone();
        tokio::spawn(async move {
            let expiry = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = release.cancelled() => return,
                () = cancel.cancelled() => debug!("dial context canceled, closing connection"),
                () = expiry => debug!("dial deadline reached, closing connection"),
            }
            closer.cancel();
        });

        Self {
            stream,
            closed: Box::pin(closed.cancelled_owned()),
            is_closed: false,
            _release: released.drop_guard(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.is_closed && self.closed.as_mut().poll(cx).is_ready() {
            self.is_closed = true;
        }
        self.is_closed
    }
}

impl std::fmt::Debug for DialedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialedConn")
            .field("stream", &self.stream)
            .field("is_closed", &self.is_closed)
            .finish_non_exhaustive()
    }
}

fn canceled() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "dial context canceled")
}

fn closed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "connection closed by dial context",
    )
}

impl AsyncRead for DialedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DialedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl Connection for DialedConn {
    fn connected(&self) -> Connected {
        self.stream.connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ProxyTarget) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, ProxyTarget::new(addr.ip(), addr.port()))
    }

    #[tokio::test]
    async fn test_dial_ignores_requested_address() {
        let (listener, target) = listener().await;
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"pinned").await.unwrap();
        });

        let dialer = StaticDialer::new(target);
        let mut conn = dialer
            .dial(&DialContext::new(), "nowhere.invalid:9999")
            .await
            .unwrap();
        assert_eq!(conn.peer_addr().unwrap(), target.socket_addr());

        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pinned");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_read() {
        let (listener, target) = listener().await;
        let accept = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            // hold the socket open without writing
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let token = CancellationToken::new();
        let ctx = DialContext::new().with_cancel(token.clone());
        let mut conn = StaticDialer::new(target).dial(&ctx, "").await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("read should unblock on cancel")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(conn.write_all(b"x").await.is_err());

        canceller.await.unwrap();
        accept.abort();
    }

    #[tokio::test]
    async fn test_deadline_closes_connection() {
        let (listener, target) = listener().await;
        let accept = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let ctx = DialContext::new().with_timeout(Duration::from_millis(50));
        let mut conn = StaticDialer::new(target).dial(&ctx, "").await.unwrap();

        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("read should unblock at the deadline");
        assert!(result.is_err());
        accept.abort();
    }

    #[tokio::test]
    async fn test_dial_already_canceled() {
        let (_listener, target) = listener().await;
        let token = CancellationToken::new();
        token.cancel();
        let ctx = DialContext::new().with_cancel(token);
        let err = StaticDialer::new(target).dial(&ctx, "").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let (listener, target) = listener().await;
        drop(listener);
        assert!(StaticDialer::new(target)
            .connect_timeout(Some(Duration::from_secs(2)))
            .dial(&DialContext::new(), "")
            .await
            .is_err());
    }
}
