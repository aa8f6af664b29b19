//! Admin API — read service state and drive start/stop out of band
//!
//! Bound to its own listener, guarded by an optional IP allowlist (checked
//! first, 403) and an optional bearer token (401). Service lookups go by
//! name over the full registry, so port-only services are visible too.

use crate::gateway::Gateway;
use crate::service::{Service, ServiceStatus};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use ipnet::IpNet;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const API_PREFIX: &str = "/_dynapm/api";

type AdminBody = BoxBody<Bytes, Infallible>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<AdminBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).boxed())
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<AdminBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).boxed())
        .expect("valid response with StatusCode enum and static header")
}

/// IP allowlist supporting CIDR ranges and single addresses
pub struct IpMatcher {
    networks: Vec<IpNet>,
    single_ips: Vec<IpAddr>,
}

impl IpMatcher {
    pub fn new(entries: &[String]) -> anyhow::Result<Self> {
        let mut networks = Vec::new();
        let mut single_ips = Vec::new();

        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.contains('/') {
                let net: IpNet = trimmed
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid CIDR '{}': {}", trimmed, e))?;
                networks.push(net);
            } else {
                let ip: IpAddr = trimmed
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid IP address '{}': {}", trimmed, e))?;
                single_ips.push(ip);
            }
        }

        Ok(Self {
            networks,
            single_ips,
        })
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.single_ips.contains(&ip) {
            return true;
        }
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.single_ips.is_empty()
    }
}

/// Admin API server
pub struct AdminServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    auth_token: Option<Arc<String>>,
    allowlist: Option<Arc<IpMatcher>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway>,
        auth_token: Option<String>,
        allowed_ips: &[String],
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let matcher = IpMatcher::new(allowed_ips)?;
        let allowlist = if matcher.is_empty() {
            None
        } else {
            Some(Arc::new(matcher))
        };
        Ok(Self {
            listener,
            gateway,
            auth_token: auth_token.map(Arc::new),
            allowlist,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener has a local address")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr(), "admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let auth_token = self.auth_token.clone();
                            let allowlist = self.allowlist.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let gateway = Arc::clone(&gateway);
                                    let auth_token = auth_token.clone();
                                    let allowlist = allowlist.clone();
                                    async move {
                                        handle_admin_request(req, gateway, auth_token, allowlist, addr)
                                            .await
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
    auth_token: Option<Arc<String>>,
    allowlist: Option<Arc<IpMatcher>>,
    client_addr: SocketAddr,
) -> Result<Response<AdminBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, addr = %client_addr, "admin API request");

    // IP rejection wins over token problems
    if let Some(ref matcher) = allowlist {
        if !matcher.is_allowed(client_addr.ip()) {
            warn!(addr = %client_addr, %path, "admin request from disallowed IP");
            return Ok(response(StatusCode::FORBIDDEN, "forbidden"));
        }
    }
    if let Some(ref token) = auth_token {
        if !check_auth(&req, token) {
            warn!(addr = %client_addr, %path, "unauthorized admin request");
            return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    }

    // admin-plane health and version, outside the API prefix
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    };

    let response = match (&method, rest) {
        (&Method::GET, "/services") => list_services(&gateway),

        (&Method::GET, "/events") => events_stream(),

        (&Method::GET, rest) if rest.starts_with("/services/") => {
            let name = rest.trim_start_matches("/services/");
            match gateway.service(name) {
                Some(service) => service_detail(service),
                None => response(StatusCode::NOT_FOUND, "unknown service"),
            }
        }

        (&Method::POST, rest) if rest.starts_with("/services/") && rest.ends_with("/stop") => {
            let name = rest
                .trim_start_matches("/services/")
                .trim_end_matches("/stop");
            match gateway.service(name) {
                Some(service) => stop_service(&gateway, service).await,
                None => response(StatusCode::NOT_FOUND, "unknown service"),
            }
        }

        (&Method::POST, rest) if rest.starts_with("/services/") && rest.ends_with("/start") => {
            let name = rest
                .trim_start_matches("/services/")
                .trim_end_matches("/start");
            match gateway.service(name) {
                Some(service) => start_service(&gateway, service).await,
                None => response(StatusCode::NOT_FOUND, "unknown service"),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn service_summary(service: &Arc<Service>) -> serde_json::Value {
    let snapshot = service.snapshot();
    let last_access_ms = snapshot
        .last_access
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    serde_json::json!({
        "name": service.name,
        "base": service.upstream.to_string(),
        "status": snapshot.status,
        "uptime": snapshot.uptime.as_secs(),
        "lastAccessTime": last_access_ms,
        "activeConnections": snapshot.active_connections,
        "idleTimeout": service.idle_timeout.as_secs(),
        "proxyOnly": service.proxy_only,
    })
}

fn list_services(gateway: &Arc<Gateway>) -> Response<AdminBody> {
    let mut services: Vec<serde_json::Value> =
        gateway.services.values().map(service_summary).collect();
    services.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    let body = serde_json::json!({ "services": services });
    json_response(StatusCode::OK, body.to_string())
}

fn service_detail(service: &Arc<Service>) -> Response<AdminBody> {
    let snapshot = service.snapshot();
    let mut body = service_summary(service);
    body["startTimeout"] = serde_json::json!(service.start_timeout.as_secs());
    body["healthCheck"] = serde_json::json!(service.health.kind());
    body["startCount"] = serde_json::json!(snapshot.start_count);
    body["totalUptime"] = serde_json::json!(snapshot.total_uptime.as_secs());
    json_response(StatusCode::OK, body.to_string())
}

async fn stop_service(gateway: &Arc<Gateway>, service: &Arc<Service>) -> Response<AdminBody> {
    if service.proxy_only {
        return json_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":"service is proxy-only"}"#,
        );
    }
    if service.status() != ServiceStatus::Online {
        return json_response(StatusCode::BAD_REQUEST, r#"{"error":"service is not online"}"#);
    }
    gateway.manager.stop(service).await;
    info!(service = %service.name, "service stopped via admin API");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "name": service.name, "status": service.status() }).to_string(),
    )
}

async fn start_service(gateway: &Arc<Gateway>, service: &Arc<Service>) -> Response<AdminBody> {
    if service.proxy_only {
        return json_response(
            StatusCode::BAD_REQUEST,
            r#"{"error":"service is proxy-only"}"#,
        );
    }
    match service.status() {
        ServiceStatus::Online | ServiceStatus::Starting => {
            return json_response(
                StatusCode::BAD_REQUEST,
                r#"{"error":"service is already online or starting"}"#,
            );
        }
        ServiceStatus::Stopping => {
            return json_response(StatusCode::BAD_REQUEST, r#"{"error":"service is stopping"}"#);
        }
        ServiceStatus::Offline => {}
    }

    match gateway.manager.start(service).await {
        Ok(()) => {
            info!(service = %service.name, "service started via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "name": service.name, "status": service.status() })
                    .to_string(),
            )
        }
        Err(e) => {
            let status = e.code.status_code();
            let body = serde_json::json!({
                "error": e.message,
                "code": e.code.as_header_value(),
            });
            json_response(status, body.to_string())
        }
    }
}

/// Server-sent state-change events. The stream opens with a `connected`
/// event and stays open; further event kinds are reserved.
fn events_stream() -> Response<AdminBody> {
    use futures_util::stream::{self, StreamExt};

    let connected = Bytes::from_static(b"event: connected\ndata: {}\n\n");
    let body = StreamBody::new(
        stream::iter([Ok::<_, Infallible>(Frame::data(connected))]).chain(stream::pending()),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(BodyExt::boxed(body))
        .expect("valid response with StatusCode enum and static headers")
}
