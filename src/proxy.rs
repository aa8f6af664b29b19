//! HTTP proxy engine and listener set
//!
//! Every listener accepts HTTP/1.1 and h2c with upgrade support and
//! dispatches into the same handler: resolve the route, buffer the request
//! body, pull the service up if needed, then stream the upstream response
//! back. Response bodies are forwarded chunk by chunk; the pull-based body
//! polling means bytes are never read from the upstream faster than the
//! client accepts them, on both directions of the stream.

use crate::error::{error_response, json_error_response, GatewayErrorCode};
use crate::gateway::Gateway;
use crate::router::RouteTarget;
use crate::service::ConnectionGuard;
use crate::ws;
use http::uri::Uri;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// A bound HTTP/WebSocket listener. The main listener routes by hostname;
/// port-bound listeners carry their route and ignore the Host header.
pub struct ProxyListener {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    bound_route: Option<RouteTarget>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        bound_route: Option<RouteTarget>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gateway,
            bound_route,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener has a local address")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr();
        match &self.bound_route {
            Some(route) => {
                info!(%addr, service = %route.service.name, "port listener ready")
            }
            None => info!(%addr, "gateway listening (HTTP/1.1 and HTTP/2, with upgrades)"),
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let bound_route = self.bound_route.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, client_addr, gateway, bound_route).await
                                {
                                    debug!(addr = %client_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(%addr, "listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    gateway: Arc<Gateway>,
    bound_route: Option<RouteTarget>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let bound_route = bound_route.clone();
        async move { handle_request(req, gateway, bound_route, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    bound_route: Option<RouteTarget>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // port-bound listeners carry their route; the main listener selects by
    // the Host header
    let route = match bound_route {
        Some(route) => route,
        None => {
            let Some(hostname) = extract_hostname(&req) else {
                return Ok(json_error_response(
                    GatewayErrorCode::RouteNotFound,
                    "missing or invalid Host header",
                ));
            };
            match gateway.router.resolve_host(&hostname) {
                Some(route) => route.clone(),
                None => {
                    debug!(hostname, "no route for host");
                    return Ok(json_error_response(
                        GatewayErrorCode::RouteNotFound,
                        format!("no route for host: {}", hostname),
                    ));
                }
            }
        }
    };

    // last-access moves before any blocking work (body buffering included)
    route.service.touch();

    if is_upgrade_request(&req) {
        return ws::handle_upgrade(req, route, gateway, request_id).await;
    }

    let method = req.method().clone();
    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // the start gate may outlive the request's initial reception, so the
    // body is collected up front (bounded) and replayed onto the upstream
    let body_bytes = match buffer_body(body, gateway.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(BufferError::TooLarge) => {
            return Ok(json_error_response(
                GatewayErrorCode::PayloadTooLarge,
                format!("request body exceeds {} bytes", gateway.max_body_bytes),
            ));
        }
        Err(BufferError::Read(e)) => {
            // client went away mid-body; nothing useful to send
            debug!(request_id, error = %e, "request body read failed");
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    if let Err(e) = gateway.manager.ensure_online(&route.service).await {
        warn!(service = %route.service.name, request_id, error = %e, "pull-up failed");
        return Ok(error_response(&e));
    }

    let guard = route.service.acquire();

    let uri = match upstream_uri(&route.target, &path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            error!(request_id, error = %e, "failed to build upstream URI");
            return Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "invalid upstream URI",
            ));
        }
    };

    let mut upstream_req = match Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(Full::new(body_bytes))
    {
        Ok(r) => r,
        Err(e) => {
            error!(request_id, error = %e, "failed to build upstream request");
            return Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "invalid upstream request",
            ));
        }
    };

    copy_request_headers(&parts.headers, upstream_req.headers_mut());

    let headers = upstream_req.headers_mut();
    if let Some(authority) = route.target.authority() {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(hyper::header::HOST, host);
        }
    }
    // overwrite rather than append so clients cannot spoof forwarding info
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    let upstream_resp = match gateway.pool.send(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                service = %route.service.name,
                target = %route.target,
                request_id,
                error = %e,
                "upstream unreachable"
            );
            drop(guard);
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                "failed to reach upstream",
            ));
        }
    };

    let status = upstream_resp.status();
    let (resp_parts, resp_body) = upstream_resp.into_parts();

    if gateway.logging.enable_request_log {
        info!(
            method = %method,
            path = %path_and_query,
            service = %route.service.name,
            status = status.as_u16(),
            request_id,
            "request forwarded"
        );
    }
    if gateway.logging.enable_performance_log {
        info!(
            request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request timing"
        );
    }

    // the guard rides inside the body so the connection stays counted until
    // the last byte is delivered or the client aborts
    let body = GuardedBody::new(resp_body.boxed(), guard);

    let mut response = Response::new(body.boxed());
    *response.status_mut() = status;
    copy_response_headers(&resp_parts.headers, response.headers_mut());

    Ok(response)
}

/// Copy request headers onto the upstream request: hop-by-hop headers and
/// Host are dropped, every forwarded value is CRLF-sanitized, and repeated
/// headers keep their multiplicity.
fn copy_request_headers(from: &hyper::HeaderMap, to: &mut hyper::HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop(name.as_str()) || name == hyper::header::HOST {
            continue;
        }
        if let Some(clean) = sanitize_header_value(value) {
            to.append(name.clone(), clean);
        }
    }
}

/// Copy upstream response headers to the client, dropping hop-by-hop
/// headers and preserving repeats (Set-Cookie in particular).
fn copy_response_headers(from: &hyper::HeaderMap, to: &mut hyper::HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Headers scoped to a single hop, never forwarded across the proxy
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("trailers")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Strip CR, LF and NUL bytes from a header value (CRLF-injection defense).
/// Returns None when the value cannot be represented after cleaning.
pub fn sanitize_header_value(value: &HeaderValue) -> Option<HeaderValue> {
    let bytes = value.as_bytes();
    if !bytes.iter().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
        return Some(value.clone());
    }
    let cleaned: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !matches!(b, b'\r' | b'\n' | 0))
        .collect();
    HeaderValue::from_bytes(&cleaned).ok()
}

/// Rebase the request path and query onto the route target's authority
fn upstream_uri(target: &Uri, path_and_query: &str) -> Result<Uri, http::Error> {
    let mut parts = http::uri::Parts::default();
    parts.scheme = target.scheme().cloned();
    parts.authority = target.authority().cloned();
    parts.path_and_query = Some(path_and_query.parse::<http::uri::PathAndQuery>()?);
    Ok(Uri::from_parts(parts)?)
}

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // alphanumeric, hyphen and dot only; rejects log-injection input
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// Check if a request is a protocol upgrade (WebSocket) request
pub fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

enum BufferError {
    TooLarge,
    Read(Box<dyn std::error::Error + Send + Sync>),
}

/// Collect the inbound body into memory, bounded by `limit`
async fn buffer_body(body: Incoming, limit: usize) -> Result<Bytes, BufferError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            if e.is::<http_body_util::LengthLimitError>() {
                Err(BufferError::TooLarge)
            } else {
                Err(BufferError::Read(e))
            }
        }
    }
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response =
        Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// Response body wrapper that keeps the service's connection count held
/// until the stream fully terminates (completion, error or client abort)
struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _guard: ConnectionGuard,
}

impl GuardedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, guard: ConnectionGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
