//! WebSocket bridging between client connections and upstream services
//!
//! The client upgrade is answered immediately so the client is connected
//! while the service pulls up; the upstream socket is dialed afterwards.
//! Frames the client sends before the upstream is open are queued in order
//! and drained once the dial completes.

use crate::gateway::Gateway;
use crate::proxy::sanitize_header_value;
use crate::router::RouteTarget;
use futures_util::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Cap on frames queued while the upstream socket is still connecting
const PENDING_QUEUE_LIMIT: usize = 1024;

type ClientStream = WebSocketStream<TokioIo<Upgraded>>;
type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accept a client WebSocket upgrade and spawn the bridge session.
///
/// The 101 is sent before the upstream exists; the spawned open phase
/// pulls the service up and dials the upstream with the recorded request
/// path and headers.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    route: RouteTarget,
    gateway: Arc<Gateway>,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
        let mut response =
            Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(response);
    };
    let accept = derive_accept_key(key.as_bytes());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let forwarded_headers = forwarded_ws_headers(req.headers());

    debug!(
        service = %route.service.name,
        path = %path_and_query,
        request_id,
        "accepting websocket upgrade"
    );

    let session_gateway = Arc::clone(&gateway);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                bridge_session(
                    upgraded,
                    route,
                    session_gateway,
                    forwarded_headers,
                    path_and_query,
                    request_id,
                )
                .await;
            }
            Err(e) => {
                debug!(error = %e, "client websocket upgrade failed");
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers");
    Ok(response)
}

/// Open phase plus bridge: count the accepted client, pull the service up,
/// dial the upstream, drain queued frames, then relay until either side
/// closes.
async fn bridge_session(
    upgraded: Upgraded,
    route: RouteTarget,
    gateway: Arc<Gateway>,
    headers: HeaderMap,
    path_and_query: String,
    request_id: String,
) {
    let service = Arc::clone(&route.service);
    // one increment per accepted upgrade; the guard's drop is the single
    // decrement for the whole session
    let _guard = service.acquire();
    let ws_log = gateway.logging.enable_websocket_log;

    let mut client =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    if let Err(e) = gateway.manager.ensure_online(&service).await {
        warn!(service = %service.name, request_id, error = %e, "websocket pull-up failed");
        let _ = client.close(None).await;
        return;
    }

    let url = websocket_url(&route, &path_and_query);
    let mut upstream_req = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!(%url, error = %e, "invalid upstream websocket URL");
            let _ = client.close(None).await;
            return;
        }
    };
    for (name, value) in headers.iter() {
        upstream_req.headers_mut().append(name.clone(), value.clone());
    }

    let connector = Connector::Rustls(Arc::clone(&gateway.tls));
    let connect = connect_async_tls_with_config(upstream_req, None, true, Some(connector));
    tokio::pin!(connect);

    // frames arriving before the upstream opens are held in order
    let mut pending: VecDeque<Message> = VecDeque::new();
    let mut upstream: UpstreamStream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((ws, _response)) => break ws,
                Err(e) => {
                    warn!(service = %service.name, %url, request_id, error = %e, "upstream websocket connect failed");
                    let _ = client.close(None).await;
                    return;
                }
            },
            frame = client.next() => match frame {
                Some(Ok(msg)) if msg.is_close() => {
                    debug!(service = %service.name, request_id, "client closed before upstream opened");
                    return;
                }
                Some(Ok(msg)) => {
                    if pending.len() >= PENDING_QUEUE_LIMIT {
                        warn!(service = %service.name, request_id, "pending frame queue overflow");
                        let _ = client.close(None).await;
                        return;
                    }
                    pending.push_back(msg);
                }
                _ => {
                    debug!(service = %service.name, request_id, "client dropped before upstream opened");
                    return;
                }
            },
        }
    };

    for msg in pending.drain(..) {
        if upstream.send(msg).await.is_err() {
            let _ = client.close(None).await;
            return;
        }
    }

    if ws_log {
        info!(service = %service.name, %url, request_id, "websocket bridged");
    } else {
        debug!(service = %service.name, %url, request_id, "websocket bridged");
    }

    relay(client, upstream, &service.name, &request_id, ws_log).await;
}

/// Relay frames both ways, preserving binary/text. When either side closes
/// or errors, close the other exactly once; the trailing closes are no-ops
/// on an already-closed stream.
async fn relay(
    mut client: ClientStream,
    mut upstream: UpstreamStream,
    service: &str,
    request_id: &str,
    ws_log: bool,
) {
    let mut client_frames: u64 = 0;
    let mut upstream_frames: u64 = 0;

    loop {
        tokio::select! {
            msg = client.next() => match msg {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        let _ = upstream.close(None).await;
                        break;
                    }
                    client_frames += 1;
                    if upstream.send(msg).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = upstream.close(None).await;
                    break;
                }
            },
            msg = upstream.next() => match msg {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        let _ = client.close(None).await;
                        break;
                    }
                    upstream_frames += 1;
                    if client.send(msg).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = client.close(None).await;
                    break;
                }
            },
        }
    }

    // best-effort close of whichever side is still open
    let _ = client.close(None).await;
    let _ = upstream.close(None).await;

    if ws_log {
        info!(
            service,
            request_id, client_frames, upstream_frames, "websocket session closed"
        );
    } else {
        debug!(
            service,
            request_id, client_frames, upstream_frames, "websocket session closed"
        );
    }
}

/// Upstream WebSocket URL: ws/wss derived from the route target's scheme,
/// reproducing the client's path and query
fn websocket_url(route: &RouteTarget, path_and_query: &str) -> String {
    let scheme = if route.https { "wss" } else { "ws" };
    let authority = route
        .target
        .authority()
        .map(|a| a.as_str())
        .unwrap_or("localhost");
    format!("{}://{}{}", scheme, authority, path_and_query)
}

/// Client headers forwarded to the upstream handshake. The client library
/// regenerates Host, Connection, Upgrade and the Sec-WebSocket handshake
/// headers; extension negotiation is per-hop, so that header stays too.
fn forwarded_ws_headers(from: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in from.iter() {
        if name == HOST
            || name == CONNECTION
            || name == UPGRADE
            || name == SEC_WEBSOCKET_KEY
            || name == SEC_WEBSOCKET_VERSION
            || name.as_str().eq_ignore_ascii_case("sec-websocket-extensions")
        {
            continue;
        }
        if let Some(clean) = sanitize_header_value(value) {
            headers.append(name.clone(), clean);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{HealthCheck, Service};
    use hyper::header::HeaderValue;
    use std::time::Duration;

    fn route(target: &str) -> RouteTarget {
        let target: http::Uri = target.parse().unwrap();
        let https = target.scheme_str() == Some("https");
        RouteTarget {
            service: Arc::new(Service::new(
                "ws-test".to_string(),
                target.clone(),
                None,
                HealthCheck::None,
                Duration::from_secs(300),
                Duration::from_secs(30),
                true,
            )),
            target,
            https,
        }
    }

    #[test]
    fn test_websocket_url_plain() {
        let route = route("http://127.0.0.1:9011");
        assert_eq!(
            websocket_url(&route, "/chat?room=1"),
            "ws://127.0.0.1:9011/chat?room=1"
        );
    }

    #[test]
    fn test_websocket_url_tls() {
        let route = route("https://backend.internal:8443");
        assert_eq!(websocket_url(&route, "/"), "wss://backend.internal:8443/");
    }

    #[test]
    fn test_forwarded_headers_exclude_handshake_set() {
        let mut from = HeaderMap::new();
        from.insert(HOST, HeaderValue::from_static("a.test"));
        from.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        from.insert(UPGRADE, HeaderValue::from_static("websocket"));
        from.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        from.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        from.insert(
            "sec-websocket-extensions",
            HeaderValue::from_static("permessage-deflate"),
        );
        from.insert("sec-websocket-protocol", HeaderValue::from_static("chat"));
        from.insert("authorization", HeaderValue::from_static("Bearer token"));
        from.insert("cookie", HeaderValue::from_static("session=abc"));

        let forwarded = forwarded_ws_headers(&from);
        assert!(forwarded.get(HOST).is_none());
        assert!(forwarded.get(CONNECTION).is_none());
        assert!(forwarded.get(UPGRADE).is_none());
        assert!(forwarded.get(SEC_WEBSOCKET_KEY).is_none());
        assert!(forwarded.get(SEC_WEBSOCKET_VERSION).is_none());
        assert!(forwarded.get("sec-websocket-extensions").is_none());
        assert_eq!(forwarded.get("sec-websocket-protocol").unwrap(), "chat");
        assert_eq!(forwarded.get("authorization").unwrap(), "Bearer token");
        assert_eq!(forwarded.get("cookie").unwrap(), "session=abc");
    }

    #[test]
    fn test_forwarded_headers_sanitized() {
        let mut from = HeaderMap::new();
        from.insert(
            "x-test",
            HeaderValue::from_bytes(b"foo\rEvil: yes").unwrap(),
        );
        let forwarded = forwarded_ws_headers(&from);
        assert_eq!(forwarded.get("x-test").unwrap(), "fooEvil: yes");
    }
}
