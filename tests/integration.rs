//! Integration tests driving the bound listeners over raw TCP

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dynapm::admin::AdminServer;
use dynapm::config::Config;
use dynapm::gateway::Gateway;
use dynapm::proxy::ProxyListener;
use dynapm::reaper;
use dynapm::service::ServiceStatus;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// ============================================================================
// Helpers
// ============================================================================

/// Upstream HTTP server that records every request and echoes bodies back
struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockUpstream {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    // keep-alive: the gateway pool reuses this connection
                    while let Some((head, body)) = read_http_request(&mut stream).await {
                        let slow = head.starts_with("GET /slow");
                        recorded.lock().push(head);

                        if slow {
                            let response = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Type: text/plain\r\n\r\n";
                            if stream.write_all(response).await.is_err() {
                                return;
                            }
                            let _ = stream.write_all(b"01234").await;
                            let _ = stream.flush().await;
                            tokio::time::sleep(Duration::from_millis(800)).await;
                            if stream.write_all(b"56789").await.is_err() {
                                return;
                            }
                            continue;
                        }

                        let header = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nSet-Cookie: a=1; Path=/\r\nSet-Cookie: b=2; Path=/\r\n\r\n",
                            body.len()
                        );
                        if stream.write_all(header.as_bytes()).await.is_err() {
                            return;
                        }
                        if stream.write_all(&body).await.is_err() {
                            return;
                        }
                        let _ = stream.flush().await;
                    }
                });
            }
        });

        Self { addr, requests }
    }

    fn port(&self) -> u16 {
        self.addr.port()
    }

    fn recorded(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

/// Read one HTTP request (head + body per Content-Length) off the stream
async fn read_http_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some((head, buf[body_start..body_start + content_length].to_vec()))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A gateway with its main listener bound to an ephemeral port
struct TestGateway {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn spawn_gateway(toml: &str) -> TestGateway {
    let config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();
    let gateway = Gateway::from_config(&config).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = ProxyListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&gateway),
        None,
        shutdown_rx.clone(),
    )
    .await
    .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.run());

    TestGateway {
        gateway,
        addr,
        shutdown_rx,
        _shutdown_tx: shutdown_tx,
    }
}

fn marker_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dynapm-it-{}-{}", tag, std::process::id()))
}

fn marker_lines(path: &PathBuf) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Send a raw HTTP request and return the full response bytes
async fn raw_request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    // tolerate a reset after the server answers and closes with unread
    // request bytes still in flight (the 413 path)
    let _ = stream.read_to_end(&mut response).await;
    response
}

async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> String {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    String::from_utf8_lossy(&raw_request(addr, request.as_bytes()).await).to_string()
}

fn status_code(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn response_body(response: &[u8]) -> Vec<u8> {
    match find_subsequence(response, b"\r\n\r\n") {
        Some(pos) => response[pos + 4..].to_vec(),
        None => Vec::new(),
    }
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_unknown_host_gets_404() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;

    let response = http_get_with_host(gw.addr, "/", "unknown.test").await;
    assert_eq!(status_code(&response), 404);
    assert!(response.contains("X-Gateway-Error: ROUTE_NOT_FOUND") || response.contains("x-gateway-error: ROUTE_NOT_FOUND"));
}

#[tokio::test]
async fn test_dead_upstream_gets_502() {
    // port 1 is essentially never listening on loopback
    let toml = r#"
[services.dead]
base = "http://127.0.0.1:1"
host = "c.test"
proxy_only = true
"#;
    let gw = spawn_gateway(toml).await;

    let response = http_get_with_host(gw.addr, "/", "c.test").await;
    assert_eq!(status_code(&response), 502);
}

#[tokio::test]
async fn test_port_bound_listener_ignores_host_header() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;

    // bind a dedicated listener for the route, as the listener set does
    let route = gw.gateway.router.resolve_host("a.test").unwrap().clone();
    let port_listener = ProxyListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&gw.gateway),
        Some(route),
        gw.shutdown_rx.clone(),
    )
    .await
    .unwrap();
    let port_addr = port_listener.local_addr();
    tokio::spawn(port_listener.run());

    let response = http_get_with_host(port_addr, "/", "completely-unrelated.test").await;
    assert_eq!(status_code(&response), 200);
}

// ============================================================================
// Cold start and the state machine
// ============================================================================

#[tokio::test]
async fn test_cold_start_then_warm_reuse() {
    let upstream = MockUpstream::spawn().await;
    let marker = marker_path("coldstart");
    let _ = std::fs::remove_file(&marker);

    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{port}"
host = "a.test"
start_timeout_secs = 5
idle_timeout_secs = 10

[services.app.commands]
start = "echo start >> {marker}"
stop = "true"
check = "true"
"#,
        port = upstream.port(),
        marker = marker.display()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("app").unwrap());
    assert_eq!(svc.status(), ServiceStatus::Offline);

    let response = http_get_with_host(gw.addr, "/", "a.test").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.status(), ServiceStatus::Online);
    assert_eq!(svc.start_count(), 1);
    assert_eq!(marker_lines(&marker), 1);

    // a warm service forwards without a second start
    let response = http_get_with_host(gw.addr, "/again", "a.test").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.start_count(), 1);
    assert_eq!(marker_lines(&marker), 1);

    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn test_failed_start_gets_503_and_resets() {
    let toml = r#"
[services.broken]
base = "http://127.0.0.1:1"
host = "broken.test"
start_timeout_secs = 5

[services.broken.commands]
start = "echo no such service >&2; exit 1"
stop = "true"
check = "false"
"#;
    let gw = spawn_gateway(toml).await;
    let svc = Arc::clone(gw.gateway.service("broken").unwrap());

    let response = http_get_with_host(gw.addr, "/", "broken.test").await;
    assert_eq!(status_code(&response), 503);
    assert_eq!(svc.status(), ServiceStatus::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pull_up_runs_start_once() {
    let upstream = MockUpstream::spawn().await;
    let marker = marker_path("pullup");
    let _ = std::fs::remove_file(&marker);

    let toml = format!(
        r#"
[services.b]
base = "http://127.0.0.1:{port}"
host = "b.test"
start_timeout_secs = 10

[services.b.commands]
start = "echo start >> {marker}; sleep 0.2"
stop = "true"
check = "true"
"#,
        port = upstream.port(),
        marker = marker.display()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("b").unwrap());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let addr = gw.addr;
        handles.push(tokio::spawn(async move {
            http_get_with_host(addr, "/", "b.test").await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(status_code(&response), 200);
    }

    assert_eq!(marker_lines(&marker), 1, "start command ran more than once");
    assert_eq!(svc.start_count(), 1);

    let _ = std::fs::remove_file(&marker);
}

// ============================================================================
// Forwarding semantics
// ============================================================================

#[tokio::test]
async fn test_body_round_trip_and_repeated_headers() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;

    let body: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    let mut request = format!(
        "POST /echo HTTP/1.1\r\nHost: a.test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let response = raw_request(gw.addr, &request).await;
    let text = String::from_utf8_lossy(&response).to_string();
    assert_eq!(status_code(&text), 200);

    // upstream body comes back byte-identical
    assert_eq!(response_body(&response), body);

    // repeated Set-Cookie headers keep their multiplicity
    let cookie_lines = text
        .lines()
        .filter(|l| l.to_ascii_lowercase().starts_with("set-cookie:"))
        .count();
    assert_eq!(cookie_lines, 2);
}

#[tokio::test]
async fn test_forwarded_headers_rewritten_for_upstream() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;

    let request = format!(
        "GET /headers HTTP/1.1\r\nHost: a.test\r\nX-Keep: yes\r\nTE: trailers\r\nConnection: close\r\n\r\n"
    );
    let response = raw_request(gw.addr, request.as_bytes()).await;
    assert_eq!(status_code(&String::from_utf8_lossy(&response)), 200);

    let recorded = upstream.recorded();
    let head = recorded
        .iter()
        .find(|h| h.starts_with("GET /headers"))
        .expect("upstream saw the request")
        .to_ascii_lowercase();

    // custom headers pass, hop-by-hop headers do not
    assert!(head.contains("x-keep: yes"));
    assert!(!head.contains("\nte:"));
    // Host is rewritten to the target, the original travels in X-Forwarded-Host
    assert!(head.contains(&format!("host: 127.0.0.1:{}", upstream.port())));
    assert!(head.contains("x-forwarded-host: a.test"));
    assert!(head.contains("x-forwarded-proto: http"));
    assert!(head.contains("x-request-id:"));
}

#[tokio::test]
async fn test_oversized_body_gets_413() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
max_body_bytes = 1024

[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;

    let body = vec![b'x'; 4096];
    let mut request = format!(
        "POST / HTTP/1.1\r\nHost: a.test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);

    let response = raw_request(gw.addr, &request).await;
    assert_eq!(status_code(&String::from_utf8_lossy(&response)), 413);
}

// ============================================================================
// Active connections and idle reaping
// ============================================================================

#[tokio::test]
async fn test_streaming_response_pins_service_online() {
    let upstream = MockUpstream::spawn().await;
    let marker = marker_path("pin");
    let _ = std::fs::remove_file(&marker);

    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{port}"
host = "a.test"
idle_timeout_secs = 0

[services.app.commands]
start = "true"
stop = "echo stop >> {marker}"
check = "true"

[services.app.health_check]
type = "none"
"#,
        port = upstream.port(),
        marker = marker.display()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("app").unwrap());

    // long-lived response: upstream writes half, stalls, then finishes
    let addr = gw.addr;
    let reader = tokio::spawn(async move { http_get_with_host(addr, "/slow", "a.test").await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(svc.status(), ServiceStatus::Online);
    assert_eq!(svc.active_connections(), 1);

    // despite the zero idle window, an active stream inhibits the reap
    reaper::sweep(&gw.gateway).await;
    assert_eq!(svc.status(), ServiceStatus::Online);
    assert_eq!(marker_lines(&marker), 0);

    let response = reader.await.unwrap();
    assert_eq!(status_code(&response), 200);
    assert!(response.ends_with("0123456789"));

    // once the stream is gone the next sweep stops the service
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(svc.active_connections(), 0);
    reaper::sweep(&gw.gateway).await;
    assert_eq!(svc.status(), ServiceStatus::Offline);
    assert_eq!(marker_lines(&marker), 1);

    let _ = std::fs::remove_file(&marker);
}

#[tokio::test]
async fn test_idle_reap_cycle() {
    let upstream = MockUpstream::spawn().await;
    let marker = marker_path("reap");
    let _ = std::fs::remove_file(&marker);

    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{port}"
host = "a.test"
idle_timeout_secs = 1

[services.app.commands]
start = "true"
stop = "echo stop >> {marker}"
check = "true"

[services.app.health_check]
type = "none"
"#,
        port = upstream.port(),
        marker = marker.display()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("app").unwrap());

    let response = http_get_with_host(gw.addr, "/", "a.test").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.status(), ServiceStatus::Online);

    // within the idle window nothing happens
    reaper::sweep(&gw.gateway).await;
    assert_eq!(svc.status(), ServiceStatus::Online);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    reaper::sweep(&gw.gateway).await;
    assert_eq!(svc.status(), ServiceStatus::Offline);
    assert_eq!(marker_lines(&marker), 1);

    // the next request pulls the service back up
    let response = http_get_with_host(gw.addr, "/", "a.test").await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.status(), ServiceStatus::Online);
    assert_eq!(svc.start_count(), 2);

    let _ = std::fs::remove_file(&marker);
}

// ============================================================================
// WebSocket bridging
// ============================================================================

/// Upstream WebSocket echo server
async fn spawn_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if msg.is_binary() || msg.is_text() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_websocket_binary_echo_through_gateway() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Message;

    let echo_addr = spawn_ws_echo().await;
    let toml = format!(
        r#"
[services.w]
base = "http://127.0.0.1:{port}"
host = "w.test"

[services.w.commands]
start = "true"
stop = "true"
check = "true"

[services.w.health_check]
type = "none"
"#,
        port = echo_addr.port()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("w").unwrap());

    let mut request = format!("ws://{}/bridge", gw.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(http::header::HOST, "w.test".parse().unwrap());

    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status(), 101);

    // cold start happened behind the upgrade
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    ws.send(Message::Binary(payload.clone())).await.unwrap();

    let echoed = loop {
        match ws.next().await.expect("echo frame").unwrap() {
            Message::Binary(data) => break data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    };
    assert_eq!(echoed, payload);
    assert_eq!(svc.status(), ServiceStatus::Online);
    assert_eq!(svc.active_connections(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    // the session counter returns to zero after close
    let mut settled = false;
    for _ in 0..40 {
        if svc.active_connections() == 0 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(settled, "active connections did not return to zero");
}

#[tokio::test]
async fn test_websocket_text_round_trip() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Message;

    let echo_addr = spawn_ws_echo().await;
    let toml = format!(
        r#"
[services.w]
base = "http://127.0.0.1:{port}"
host = "w.test"
proxy_only = true
"#,
        port = echo_addr.port()
    );
    let gw = spawn_gateway(&toml).await;

    let mut request = format!("ws://{}/chat?room=7", gw.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(http::header::HOST, "w.test".parse().unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws.send(Message::Text("hello through the bridge".into()))
        .await
        .unwrap();

    match ws.next().await.expect("echo frame").unwrap() {
        Message::Text(text) => assert_eq!(text, "hello through the bridge"),
        other => panic!("unexpected frame: {:?}", other),
    }

    let _ = ws.close(None).await;
}

// ============================================================================
// Admin plane
// ============================================================================

async fn admin_request(addr: SocketAddr, method: &str, path: &str, token: Option<&str>) -> String {
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\n{}Connection: close\r\n\r\n",
        method, path, auth
    );
    String::from_utf8_lossy(&raw_request(addr, request.as_bytes()).await).to_string()
}

async fn spawn_admin(
    gateway: Arc<Gateway>,
    token: Option<&str>,
    allowed_ips: &[&str],
) -> (SocketAddr, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let allowed: Vec<String> = allowed_ips.iter().map(|s| s.to_string()).collect();
    let server = AdminServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        gateway,
        token.map(String::from),
        &allowed,
        rx,
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());
    (addr, tx)
}

#[tokio::test]
async fn test_admin_list_and_detail() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.api]
base = "http://127.0.0.1:{port}"
host = "api.test"

[services.api.commands]
start = "true"
stop = "true"
check = "true"

[services.api.health_check]
type = "none"

[services.assets]
base = "http://127.0.0.1:{port}"
port = 19443
proxy_only = true
"#,
        port = upstream.port()
    );
    let gw = spawn_gateway(&toml).await;
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), Some("secret"), &[]).await;

    // token required
    let response = admin_request(admin_addr, "GET", "/_dynapm/api/services", None).await;
    assert_eq!(status_code(&response), 401);

    let response = admin_request(admin_addr, "GET", "/_dynapm/api/services", Some("secret")).await;
    assert_eq!(status_code(&response), 200);
    // port-only services are visible too
    assert!(response.contains("\"api\""));
    assert!(response.contains("\"assets\""));
    assert!(response.contains("\"status\":\"offline\""));
    assert!(response.contains("\"status\":\"online\""));

    let response =
        admin_request(admin_addr, "GET", "/_dynapm/api/services/api", Some("secret")).await;
    assert_eq!(status_code(&response), 200);
    assert!(response.contains("\"healthCheck\":\"none\""));
    assert!(response.contains("\"startCount\":0"));

    let response =
        admin_request(admin_addr, "GET", "/_dynapm/api/services/nope", Some("secret")).await;
    assert_eq!(status_code(&response), 404);
}

#[tokio::test]
async fn test_admin_ip_allowlist_rejects_before_auth() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;
    // loopback is not in the allowlist
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), Some("secret"), &["10.0.0.0/8"]).await;

    let response = admin_request(admin_addr, "GET", "/_dynapm/api/services", Some("secret")).await;
    assert_eq!(status_code(&response), 403);
}

#[tokio::test]
async fn test_admin_start_and_stop_lifecycle() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{port}"
host = "a.test"

[services.app.commands]
start = "true"
stop = "true"
check = "true"

[services.app.health_check]
type = "none"
"#,
        port = upstream.port()
    );
    let gw = spawn_gateway(&toml).await;
    let svc = Arc::clone(gw.gateway.service("app").unwrap());
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), None, &[]).await;

    // offline → start → online
    let response =
        admin_request(admin_addr, "POST", "/_dynapm/api/services/app/start", None).await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.status(), ServiceStatus::Online);

    // starting it again is a client error
    let response =
        admin_request(admin_addr, "POST", "/_dynapm/api/services/app/start", None).await;
    assert_eq!(status_code(&response), 400);

    // online → stop → offline
    let response = admin_request(admin_addr, "POST", "/_dynapm/api/services/app/stop", None).await;
    assert_eq!(status_code(&response), 200);
    assert_eq!(svc.status(), ServiceStatus::Offline);

    // stopping an offline service is a client error
    let response = admin_request(admin_addr, "POST", "/_dynapm/api/services/app/stop", None).await;
    assert_eq!(status_code(&response), 400);
}

#[tokio::test]
async fn test_admin_start_failure_maps_to_503() {
    let toml = r#"
[services.broken]
base = "http://127.0.0.1:1"
host = "broken.test"
start_timeout_secs = 5

[services.broken.commands]
start = "exit 1"
stop = "true"
check = "false"
"#;
    let gw = spawn_gateway(toml).await;
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), None, &[]).await;

    let response =
        admin_request(admin_addr, "POST", "/_dynapm/api/services/broken/start", None).await;
    assert_eq!(status_code(&response), 503);
    assert!(response.contains("START_FAILED"));
}

#[tokio::test]
async fn test_admin_events_emits_connected() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), None, &[]).await;

    let mut stream = TcpStream::connect(admin_addr).await.unwrap();
    stream
        .write_all(b"GET /_dynapm/api/events HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();

    // the stream stays open, so read until the connected event shows up
    let mut collected = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let n = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for connected event")
            .unwrap();
        assert!(n > 0, "admin closed the event stream early");
        collected.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&collected);
        if text.contains("event: connected") {
            assert!(text.contains("text/event-stream"));
            break;
        }
    }
}

#[tokio::test]
async fn test_admin_health_and_version() {
    let upstream = MockUpstream::spawn().await;
    let toml = format!(
        r#"
[services.app]
base = "http://127.0.0.1:{}"
host = "a.test"
proxy_only = true
"#,
        upstream.port()
    );
    let gw = spawn_gateway(&toml).await;
    let (admin_addr, _admin_tx) = spawn_admin(Arc::clone(&gw.gateway), None, &[]).await;

    let response = admin_request(admin_addr, "GET", "/health", None).await;
    assert_eq!(status_code(&response), 200);

    let response = admin_request(admin_addr, "GET", "/version", None).await;
    assert_eq!(status_code(&response), 200);
    assert!(response.contains("dynapm"));
}
