//! Rewriting reverse proxy.
//!
//! Requests arriving for `external_host` are forwarded to a pinned backend
//! address with every occurrence of `external_host` replaced by
//! `internal_host` in the URL, headers and body. Responses travel back with
//! the substitution reversed.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HOST};
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderMap, HeaderValue, Uri, Version};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::TryStreamExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::dialer::{ProxyTarget, StaticDialer};
use crate::error::ProxyError;
use crate::replacer::{ReplaceError, Replacer, DEFAULT_BUFFER_SIZE};

/// Headers that describe one hop rather than the message. Dropped in both
/// directions; `content-length` goes too because bodies are re-framed after
/// substitution.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// One external hostname fronting one pinned backend.
pub struct RewriteProxy {
    external_host: String,
    internal_host: String,
    target: ProxyTarget,
    buffer_size: usize,
    connect_timeout: Option<Duration>,
    shutdown: CancellationToken,
    client: OnceLock<Client<StaticDialer, Body>>,
}

impl RewriteProxy {
    /// Fails if `buffer_size` cannot hold a boundary window for either
    /// hostname.
    pub fn new(
        external_host: impl Into<String>,
        internal_host: impl Into<String>,
        target: ProxyTarget,
        buffer_size: usize,
    ) -> Result<Self, ReplaceError> {
        let proxy = Self {
            external_host: external_host.into(),
            internal_host: internal_host.into(),
            target,
            buffer_size: if buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                buffer_size
            },
            connect_timeout: None,
            shutdown: CancellationToken::new(),
            client: OnceLock::new(),
        };
        let mut replacer = proxy.replacer();
        replacer.check()?;
        replacer.reverse();
        replacer.check()?;
        Ok(proxy)
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Close every backend connection once `token` fires.
    #[must_use]
    pub fn shutdown_on(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn target(&self) -> ProxyTarget {
        self.target
    }

    /// The downstream to upstream substitution. Each request direction gets
    /// its own copy.
    fn replacer(&self) -> Replacer {
        Replacer::new(self.external_host.as_bytes(), self.internal_host.as_bytes())
            .with_buffer_size(self.buffer_size)
    }

    fn client(&self) -> &Client<StaticDialer, Body> {
        self.client.get_or_init(|| {
            debug!(target = %self.target, "building backend client");
            let dialer = StaticDialer::new(self.target)
                .connect_timeout(self.connect_timeout)
                .cancel_on(self.shutdown.clone());
            Client::builder(TokioExecutor::new())
                .pool_idle_timeout(Duration::from_secs(90))
                .build(dialer)
        })
    }

    /// Translate an inbound request into the one sent to the backend.
    pub fn build_request(
        &self,
        req: Request,
        replacer: &Replacer,
    ) -> Result<Request, ProxyError> {
        let (parts, body) = req.into_parts();

        let inbound_host = parts
            .uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Authority>().ok())
                    .map(|a| a.host().to_string())
            })
            .unwrap_or_else(|| self.external_host.clone());
        let host = replacer
            .replace_str(&inbound_host)
            .ok_or_else(|| ProxyError::BadRequest(format!("unusable host {inbound_host:?}")))?;

        let port = self.target.port;
        let scheme = match parts.uri.scheme() {
            Some(s) => s.clone(),
            None if port == 443 => Scheme::HTTPS,
            None => Scheme::HTTP,
        };
        let authority = authority_for(&host, port, &scheme);

        let path = parts
            .uri
            .path_and_query()
            .map_or("/", PathAndQuery::as_str);
        let path = replacer
            .replace_str(path)
            .ok_or_else(|| ProxyError::BadRequest(format!("unusable path {path:?}")))?;

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority.as_str())
            .path_and_query(path)
            .build()
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        rewrite_headers(&parts.headers, &mut headers, replacer);
        strip_hop_by_hop(&mut headers);
        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        headers.insert(HOST, host_value);

        let body = rewrite_body(body, replacer.clone())?;

        let mut out = Request::new(body);
        *out.method_mut() = parts.method;
        *out.uri_mut() = uri;
        *out.version_mut() = Version::HTTP_11;
        *out.headers_mut() = headers;
        Ok(out)
    }

    /// Send `req` to the backend and rewrite the response on its way back.
    pub async fn forward(&self, req: Request) -> Result<Response, ProxyError> {
        let mut replacer = self.replacer();
        let outbound = self.build_request(req, &replacer)?;
        debug!(method = %outbound.method(), uri = %outbound.uri(), "forwarding");

        let resp = self.client().request(outbound).await?;

        replacer.reverse();
        let (parts, body) = resp.into_parts();
        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        rewrite_headers(&parts.headers, &mut headers, &replacer);
        strip_hop_by_hop(&mut headers);

        let mut out = Response::new(rewrite_body(Body::new(body), replacer)?);
        *out.status_mut() = parts.status;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// `host[:port]`, leaving out the port when it is the scheme default.
fn authority_for(host: &str, port: u16, scheme: &Scheme) -> String {
    let default = if *scheme == Scheme::HTTPS { 443 } else { 80 };
    if port == default {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// Stream `body` through `replacer`. Empty bodies stay empty.
fn rewrite_body(body: Body, replacer: Replacer) -> Result<Body, ReplaceError> {
    if body.size_hint().exact() == Some(0) {
        return Ok(Body::empty());
    }
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    Ok(Body::from_stream(replacer.rewrite(reader)?))
}

/// Copy every header from `src` into `dst`, substituting in both names and
/// values. Repeated headers stay repeated. A pair whose rewritten form is not
/// a legal header is copied unchanged.
pub fn rewrite_headers(src: &HeaderMap, dst: &mut HeaderMap, replacer: &Replacer) {
    for (name, value) in src {
        let new_name = replacer
            .replace_str(name.as_str())
            .and_then(|n| HeaderName::from_bytes(n.as_bytes()).ok())
            .unwrap_or_else(|| name.clone());
        let new_value = HeaderValue::from_bytes(&replacer.replace_bytes(value.as_bytes()))
            .unwrap_or_else(|_| value.clone());
        dst.append(new_name, new_value);
    }
}

/// Remove [`HOP_BY_HOP`] headers and any header named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

async fn proxy_handler(State(proxy): State<Arc<RewriteProxy>>, req: Request) -> Response {
    let remote = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    match proxy.forward(req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(remote = ?remote, target = %proxy.target, "proxy request failed: {e}");
            e.into_response()
        }
    }
}

/// Router sending every request through `proxy`.
pub fn router(proxy: Arc<RewriteProxy>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(proxy)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::any;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    const EXTERNAL: &str = "front.example";
    const INTERNAL: &str = "backend.internal";

    async fn echo(headers: HeaderMap, uri: Uri, body: String) -> impl IntoResponse {
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        (
            [
                ("location", format!("http://{INTERNAL}/next")),
                ("x-backend", INTERNAL.to_string()),
            ],
            format!("{host}|{uri}|{body}"),
        )
    }

    async fn backend() -> ProxyTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(any(echo)))
                .await
                .unwrap();
        });
        ProxyTarget::new(addr.ip(), addr.port())
    }

    #[tokio::test]
    async fn test_round_trip_rewrites_both_directions() {
        let target = backend().await;
        let proxy = RewriteProxy::new(EXTERNAL, INTERNAL, target, 4096).unwrap();
        let app = router(Arc::new(proxy));

        let req = Request::builder()
            .method("POST")
            .uri(format!("/path?q={EXTERNAL}"))
            .header(HOST, EXTERNAL)
            .header("referer", format!("http://{EXTERNAL}/form"))
            .body(Body::from(format!("hello {EXTERNAL}, bye {EXTERNAL}")))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("location").unwrap(),
            &format!("http://{EXTERNAL}/next")
        );
        assert_eq!(resp.headers().get("x-backend").unwrap(), EXTERNAL);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!(
                "{EXTERNAL}:{}|/path?q={EXTERNAL}|hello {EXTERNAL}, bye {EXTERNAL}",
                target.port
            )
        );
    }

    #[tokio::test]
    async fn test_get_without_body() {
        let target = backend().await;
        let proxy = RewriteProxy::new(EXTERNAL, INTERNAL, target, 0).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(HOST, format!("{EXTERNAL}:8081"))
            .body(Body::empty())
            .unwrap();
        let resp = router(Arc::new(proxy)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!("{EXTERNAL}:{}|/|", target.port)
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = RewriteProxy::new(
            EXTERNAL,
            INTERNAL,
            ProxyTarget::new(addr.ip(), addr.port()),
            0,
        )
        .unwrap()
        .connect_timeout(Some(Duration::from_secs(2)));
        let req = Request::builder()
            .uri("/")
            .header(HOST, EXTERNAL)
            .body(Body::empty())
            .unwrap();
        let resp = router(Arc::new(proxy)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.ends_with(b"\n"));
        assert_eq!(body.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_buffer_too_small_rejected() {
        let target = ProxyTarget::new([127, 0, 0, 1].into(), 80);
        assert!(matches!(
            RewriteProxy::new(EXTERNAL, INTERNAL, target, 16),
            Err(ReplaceError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_rewrite_headers() {
        let replacer = Replacer::new(EXTERNAL, INTERNAL);
        let mut src = HeaderMap::new();
        src.append("cookie", HeaderValue::from_static("a=1; domain=front.example"));
        src.append("cookie", HeaderValue::from_static("b=2"));
        src.append("origin", HeaderValue::from_static("https://front.example"));

        let mut dst = HeaderMap::new();
        rewrite_headers(&src, &mut dst, &replacer);
        let cookies: Vec<_> = dst.get_all("cookie").iter().collect();
        assert_eq!(cookies, ["a=1; domain=backend.internal", "b=2"]);
        assert_eq!(dst.get("origin").unwrap(), "https://backend.internal");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-session"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[tokio::test]
    async fn test_build_request_infers_https_for_port_443() {
        let target = ProxyTarget::new([127, 0, 0, 1].into(), 443);
        let proxy = RewriteProxy::new(EXTERNAL, INTERNAL, target, 0).unwrap();
        let req = Request::builder()
            .uri(format!("/login?next=https://{EXTERNAL}/home"))
            .header(HOST, EXTERNAL)
            .header("connection", "keep-alive")
            .body(Body::empty())
            .unwrap();

        let out = proxy.build_request(req, &proxy.replacer()).unwrap();
        assert_eq!(
            out.uri().to_string(),
            format!("https://{INTERNAL}/login?next=https://{INTERNAL}/home")
        );
        assert_eq!(out.headers().get(HOST).unwrap(), INTERNAL);
        assert!(!out.headers().contains_key("connection"));
        assert_eq!(out.version(), Version::HTTP_11);
    }

    #[tokio::test]
    async fn test_build_request_keeps_non_default_port() {
        let target = ProxyTarget::new([127, 0, 0, 1].into(), 8443);
        let proxy = RewriteProxy::new(EXTERNAL, INTERNAL, target, 0).unwrap();
        let req = Request::builder()
            .uri("/")
            .header(HOST, format!("{EXTERNAL}:9000"))
            .body(Body::empty())
            .unwrap();

        let out = proxy.build_request(req, &proxy.replacer()).unwrap();
        assert_eq!(out.uri().to_string(), format!("http://{INTERNAL}:8443/"));
        assert_eq!(
            out.headers().get(HOST).unwrap(),
            &format!("{INTERNAL}:8443")
        );
    }

    #[tokio::test]
    async fn test_client_leaving_closes_backend_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::sync::oneshot;

        // backend that sends headers and one chunk, then holds the stream open
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = backend.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0);
                req.extend_from_slice(&buf[..n]);
            }
            sock.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n",
            )
            .await
            .unwrap();
            let next = tokio::time::timeout(Duration::from_secs(3), sock.read(&mut buf)).await;
            let _ = closed_tx.send(matches!(next, Ok(Ok(0) | Err(_))));
        });

        let target = ProxyTarget::new(backend_addr.ip(), backend_addr.port());
        let proxy = RewriteProxy::new(EXTERNAL, INTERNAL, target, 0).unwrap();
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(front, router(Arc::new(proxy))).await.unwrap();
        });

        let mut client = tokio::net::TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(format!("GET / HTTP/1.1\r\nhost: {EXTERNAL}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            head.extend_from_slice(&buf[..n]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200"));
        drop(client);

        assert!(
            closed_rx.await.unwrap(),
            "backend connection still open after the client left"
        );
    }

    #[test]
    fn test_authority_for() {
        assert_eq!(authority_for("a.com", 80, &Scheme::HTTP), "a.com");
        assert_eq!(authority_for("a.com", 443, &Scheme::HTTPS), "a.com");
        assert_eq!(authority_for("a.com", 443, &Scheme::HTTP), "a.com:443");
        assert_eq!(authority_for("a.com", 8080, &Scheme::HTTP), "a.com:8080");
    }
}
