//! HTTP and WebSocket handler

use crate::config::DaemonConfig;
use crate::connection_registry::{ConnectionHandle, ConnectionRegistry};
use crate::metrics::METRICS;
use crate::router::{DeliveryResult, MessageRouter, RouteError};
use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{CONNECTION, CONTENT_TYPE, HeaderValue, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use imserver_protocol::{PUSH_ACK_TEXT, validate_user_id};
use imserver_transport::{
    ServerStream, Transport, WsTransport, WssServer, accept_key, accept_upgraded, is_websocket_upgrade,
};
use percent_encoding::percent_decode_str;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Shared state for every HTTP connection
pub struct HandlerState {
    config: Arc<DaemonConfig>,
    router: Arc<MessageRouter>,
    next_conn_id: AtomicU64,
    /// Upgrades accepted but not yet registered
    pending_upgrades: AtomicUsize,
}

impl HandlerState {
    pub fn new(config: Arc<DaemonConfig>, router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            next_conn_id: AtomicU64::new(1),
            pending_upgrades: AtomicUsize::new(0),
        })
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.router.registry()
    }
}

/// Slot held by an upgrade between the 101 response and registration
struct PendingUpgrade(Arc<HandlerState>);

impl PendingUpgrade {
    /// Reserve a slot unless registered plus pending connections hit `max`
    fn reserve(state: &Arc<HandlerState>, max: usize) -> Option<Self> {
        let pending = state.pending_upgrades.fetch_add(1, Ordering::AcqRel);
        if state.registry().len() + pending >= max {
            state.pending_upgrades.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(state.clone()))
    }
}

impl Drop for PendingUpgrade {
    fn drop(&mut self) {
        self.0.pending_upgrades.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run the relay server on an already bound listener
pub async fn run_handler(server: WssServer, state: Arc<HandlerState>) -> Result<()> {
    loop {
        let (stream, addr) = match server.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("{}", e);
                continue;
            }
        };
        debug!("New connection from {}", addr);

        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, addr, state).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

/// Handle HTTP request
async fn handle_request(
    req: Request<Incoming>,
    addr: SocketAddr,
    state: Arc<HandlerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let config = &state.config;

    let response = if let Some(segment) = match_endpoint(&path, &config.server.endpoint_prefix) {
        let segment = segment.to_string();
        handle_connect(req, &segment, addr, state.clone()).await
    } else if config.push.enabled && path == config.push.path {
        handle_push(req, &state).await
    } else {
        match path.as_str() {
            "/index" => Ok(text_response(StatusCode::OK, "请求成功")),
            "/health" => Ok(json_response(r#"{"status":"healthy"}"#)),
            "/ready" => Ok(json_response(r#"{"status":"ready"}"#)),
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        }
    };

    match response {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!("Request error: {}", e);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ))
        }
    }
}

/// Raw `{userId}` segment if `path` is `{prefix}/{userId}`
fn match_endpoint<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    (!rest.contains('/')).then_some(rest)
}

/// Handle WebSocket connect request
async fn handle_connect(
    req: Request<Incoming>,
    segment: &str,
    addr: SocketAddr,
    state: Arc<HandlerState>,
) -> Result<Response<Full<Bytes>>> {
    if !is_websocket_upgrade(req.headers()) {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "Expected WebSocket upgrade",
        ));
    }

    let user_id = match percent_decode_str(segment).decode_utf8() {
        Ok(id) => id.into_owned(),
        Err(_) => {
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "User id is not valid UTF-8",
            ));
        }
    };

    if let Err(e) = validate_user_id(&user_id, state.config.server.max_user_id_len) {
        warn!("Rejected connection from {}: {}", addr, e);
        return Ok(text_response(StatusCode::BAD_REQUEST, &e.to_string()));
    }

    let accept = match accept_key(req.headers()) {
        Ok(accept) => accept,
        Err(e) => return Ok(text_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    // A reconnect replaces an entry, so it never grows the map
    let pending = if state.registry().lookup(&user_id).is_some() {
        None
    } else {
        match PendingUpgrade::reserve(&state, state.config.server.max_connections) {
            Some(slot) => Some(slot),
            None => {
                warn!("Connection limit reached, rejecting {}", user_id);
                return Ok(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Too many connections",
                ));
            }
        }
    };

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws_stream = accept_upgraded(upgraded).await;
                run_connection(ws_stream, user_id, conn_id, addr, state, pending).await;
            }
            Err(e) => error!("Upgrade error for {}: {}", user_id, e),
        }
    });

    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = resp.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    Ok(resp)
}

/// One connection lifecycle: register, announce, relay, deregister
async fn run_connection(
    ws_stream: ServerStream,
    user_id: String,
    conn_id: u64,
    addr: SocketAddr,
    state: Arc<HandlerState>,
    pending: Option<PendingUpgrade>,
) {
    let registry = state.registry().clone();
    let router = state.router.clone();

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let (transport, writer) = WsTransport::spawn(conn_id, ws_tx);
    let handle = ConnectionHandle::new(user_id.clone(), transport.clone());

    if let Some(previous) = registry.register(handle.clone()) {
        info!(
            "User {} reconnected, conn {} superseded by {}",
            user_id, previous.conn_id, conn_id
        );
    }
    drop(pending);
    METRICS.connections_total.inc();
    info!(
        "User {} connected from {}, online: {}",
        user_id,
        addr,
        registry.online_count()
    );

    if let Err(e) = router.announce(&handle).await {
        error!("User {}: welcome not sent: {}", user_id, e);
    }

    loop {
        let msg = tokio::select! {
            biased;
            _ = handle.disconnected() => {
                info!("User {} (conn {}) disconnected by server", user_id, conn_id);
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            Ok(Message::Text(text)) => {
                // Failures are logged by the router and stay local to this frame
                if let Err(e) = router.route_inbound(text.as_str(), &user_id).await {
                    debug!("Frame from {} not delivered: {}", user_id, e);
                }
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame from {}", data.len(), user_id);
            }
            Ok(Message::Close(frame)) => {
                debug!("Close frame from {}: {:?}", user_id, frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("User {} transport error: {}", user_id, e);
                break;
            }
        }
    }

    registry.unregister_connection(&user_id, conn_id);

    transport.close();
    drop(handle);
    let _ = writer.await;

    info!(
        "User {} disconnected, online: {}",
        user_id,
        registry.online_count()
    );
}

/// Query/form parameters of a push request
#[derive(Debug, Default, PartialEq)]
struct PushParams {
    message: Option<String>,
    to_user_id: Option<String>,
}

impl PushParams {
    /// Collect parameters from the query string and an urlencoded body;
    /// body values win.
    fn parse(query: &[u8], body: &[u8]) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query).chain(form_urlencoded::parse(body)) {
            match key.as_ref() {
                "message" => params.message = Some(value.into_owned()),
                "toUserId" => params.to_user_id = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// Handle server-side push (`?message=...&toUserId=...`)
async fn handle_push(req: Request<Incoming>, state: &HandlerState) -> Result<Response<Full<Bytes>>> {
    let query = req.uri().query().unwrap_or_default().to_string();
    let body = if req.method() == Method::POST {
        let limit = state.config.push.max_body_bytes;
        match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!("Push body over {} bytes rejected", limit);
                return Ok(text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "PAYLOAD TOO LARGE",
                ));
            }
            Err(e) => return Err(anyhow::anyhow!(e)),
        }
    } else {
        Bytes::new()
    };

    let params = PushParams::parse(query.as_bytes(), &body);
    let always_ack = state.config.push.always_ack;

    let to_user_id = match params.to_user_id {
        Some(id) => id,
        None if always_ack => String::new(),
        None => return Ok(text_response(StatusCode::BAD_REQUEST, "Missing toUserId")),
    };

    let result = state
        .router
        .push_external(&to_user_id, params.message.unwrap_or_default())
        .await;

    Ok(push_response(&result, always_ack))
}

fn push_response(result: &DeliveryResult, always_ack: bool) -> Response<Full<Bytes>> {
    if always_ack {
        return text_response(StatusCode::OK, PUSH_ACK_TEXT);
    }

    match result {
        Ok(_) => text_response(StatusCode::OK, PUSH_ACK_TEXT),
        Err(RouteError::RecipientOffline(_)) => {
            text_response(StatusCode::NOT_FOUND, "RECIPIENT OFFLINE")
        }
        Err(RouteError::DeliveryFailed { .. }) => {
            text_response(StatusCode::BAD_GATEWAY, "MSG SEND FAILED")
        }
        Err(RouteError::Malformed { .. }) => {
            text_response(StatusCode::BAD_REQUEST, "MALFORMED MESSAGE")
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn json_response(body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use imserver_transport::TransportError;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    #[test]
    fn test_match_endpoint() {
        assert_eq!(match_endpoint("/imserver/alice", "/imserver"), Some("alice"));
        assert_eq!(match_endpoint("/imserver/a%20b", "/imserver"), Some("a%20b"));
        assert_eq!(match_endpoint("/imserver/", "/imserver"), Some(""));
        assert_eq!(match_endpoint("/imserver", "/imserver"), None);
        assert_eq!(match_endpoint("/imserver/a/b", "/imserver"), None);
        assert_eq!(match_endpoint("/imserverx/a", "/imserver"), None);
        assert_eq!(match_endpoint("/pushToWeb", "/imserver"), None);
    }

    #[test]
    fn test_push_params() {
        let params = PushParams::parse(b"message=hi%20there&toUserId=bob", b"");
        assert_eq!(params.message.as_deref(), Some("hi there"));
        assert_eq!(params.to_user_id.as_deref(), Some("bob"));

        let params = PushParams::parse(b"toUserId=bob", b"message=from+body&toUserId=carol");
        assert_eq!(params.message.as_deref(), Some("from body"));
        assert_eq!(params.to_user_id.as_deref(), Some("carol"));

        assert_eq!(PushParams::parse(b"", b""), PushParams::default());
    }

    #[test]
    fn test_push_response_codes() {
        let offline: DeliveryResult = Err(RouteError::RecipientOffline("ghost".into()));
        let failed: DeliveryResult = Err(RouteError::DeliveryFailed {
            user_id: "bob".into(),
            source: TransportError::Closed(1),
        });

        assert_eq!(push_response(&Ok(crate::router::Delivery::Delivered), false).status(), 200);
        assert_eq!(push_response(&offline, false).status(), 404);
        assert_eq!(push_response(&failed, false).status(), 502);
        assert_eq!(push_response(&offline, true).status(), 200);
        assert_eq!(push_response(&failed, true).status(), 200);
    }

    async fn start() -> (SocketAddr, Arc<ConnectionRegistry>) {
        start_with(DaemonConfig::default()).await
    }

    async fn start_with(config: DaemonConfig) -> (SocketAddr, Arc<ConnectionRegistry>) {
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(false);
        let router = MessageRouter::new(registry.clone(), config.server.welcome_text.clone());
        let server = WssServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(run_handler(server, HandlerState::new(config, router)));
        (addr, registry)
    }

    async fn connect(addr: SocketAddr, user_id: &str) -> Client {
        let (mut ws, resp) = connect_async(format!("ws://{}/imserver/{}", addr, user_id))
            .await
            .unwrap();
        assert_eq!(resp.status(), 101);
        assert_eq!(next_text(&mut ws).await, "连接成功");
        ws
    }

    async fn next_text(ws: &mut Client) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        msg.into_text().unwrap().to_string()
    }

    async fn wait_for_online(registry: &ConnectionRegistry, expected: usize) {
        for _ in 0..100 {
            if registry.online_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "online count stuck at {}, expected {}",
            registry.online_count(),
            expected
        );
    }

    #[tokio::test]
    async fn test_relay_between_users() {
        let (addr, registry) = start().await;

        let mut alice = connect(addr, "alice").await;
        assert_eq!(registry.online_count(), 1);
        let mut bob = connect(addr, "bob").await;
        assert_eq!(registry.online_count(), 2);

        alice
            .send(Message::text(r#"{"toUserId":"bob","text":"hi","fromUserId":"eve"}"#))
            .await
            .unwrap();
        let relayed: Value = serde_json::from_str(&next_text(&mut bob).await).unwrap();
        assert_eq!(
            relayed,
            json!({"toUserId": "bob", "text": "hi", "fromUserId": "alice"})
        );

        bob.close(None).await.unwrap();
        wait_for_online(&registry, 1).await;
        assert!(registry.lookup("bob").is_none());

        // Offline recipient: nothing comes back and alice stays connected
        alice
            .send(Message::text(r#"{"toUserId":"bob","text":"hi"}"#))
            .await
            .unwrap();
        alice.send(Message::text("garbage")).await.unwrap();
        alice.send(Message::text("")).await.unwrap();
        assert!(registry.lookup("alice").is_some());

        let mut alice_again = connect(addr, "alice").await;
        drop(alice);
        alice_again
            .send(Message::text(r#"{"toUserId":"alice","n":1}"#))
            .await
            .unwrap();
        let echoed: Value = serde_json::from_str(&next_text(&mut alice_again).await).unwrap();
        assert_eq!(echoed, json!({"toUserId": "alice", "n": 1, "fromUserId": "alice"}));
    }

    #[tokio::test]
    async fn test_reconnect_keeps_newest_connection() {
        let (addr, registry) = start().await;

        let first = connect(addr, "carol").await;
        let _second = connect(addr, "carol").await;
        assert_eq!(registry.online_count(), 1);
        let newest = registry.lookup("carol").unwrap().conn_id;

        // The superseded socket closing must not evict the new one
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.lookup("carol").unwrap().conn_id, newest);
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_push_endpoint() {
        let (addr, registry) = start().await;
        let mut dave = connect(addr, "dave").await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{}/pushToWeb", addr))
            .query(&[("message", "server hello"), ("toUserId", "dave")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "MSG SEND SUCCESS");
        assert_eq!(next_text(&mut dave).await, "server hello");

        let resp = client
            .post(format!("http://{}/pushToWeb?toUserId=ghost", addr))
            .body("message=lost")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("http://{}/pushToWeb?message=x", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_plain_routes() {
        let (addr, _registry) = start().await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("http://{}/index", addr)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "请求成功");

        let resp = client.get(format!("http://{}/health", addr)).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        // Not an upgrade request
        let resp = client
            .get(format!("http://{}/imserver/alice", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client.get(format!("http://{}/nope", addr)).send().await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_kicked_connection_stops_relaying() {
        let (addr, registry) = start().await;
        let mut mallory = connect(addr, "mallory").await;
        let mut bob = connect(addr, "bob").await;

        registry.unregister("mallory").unwrap().disconnect();

        // Server closes its side
        let closing = tokio::time::timeout(Duration::from_secs(5), mallory.next())
            .await
            .unwrap();
        assert!(matches!(closing, Some(Ok(Message::Close(_))) | Some(Err(_)) | None));

        let _ = mallory
            .send(Message::text(r#"{"toUserId":"bob","text":"after kick"}"#))
            .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(300), bob.next())
                .await
                .is_err(),
            "kicked connection still relayed a frame"
        );
        assert!(registry.lookup("mallory").is_none());
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = DaemonConfig::default();
        config.server.max_connections = 1;
        let (addr, registry) = start_with(config).await;

        let _alice = connect(addr, "alice").await;
        assert!(
            connect_async(format!("ws://{}/imserver/bob", addr))
                .await
                .is_err()
        );

        // Reconnects replace an entry and are always let through
        let _alice_again = connect(addr, "alice").await;
        assert_eq!(registry.online_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_upgrades_count_against_limit() {
        let config = Arc::new(DaemonConfig::default());
        let router = MessageRouter::new(ConnectionRegistry::new(false), "连接成功");
        let state = HandlerState::new(config, router);

        let first = PendingUpgrade::reserve(&state, 2).unwrap();
        let _second = PendingUpgrade::reserve(&state, 2).unwrap();
        assert!(PendingUpgrade::reserve(&state, 2).is_none());
        assert_eq!(state.pending_upgrades.load(Ordering::Acquire), 2);

        drop(first);
        assert!(PendingUpgrade::reserve(&state, 2).is_some());
        assert_eq!(state.pending_upgrades.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_push_body_limit() {
        let mut config = DaemonConfig::default();
        config.push.max_body_bytes = 32;
        let (addr, _registry) = start_with(config).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}/pushToWeb?toUserId=ghost", addr))
            .body(format!("message={}", "x".repeat(100)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 413);

        let resp = client
            .post(format!("http://{}/pushToWeb?toUserId=ghost", addr))
            .body("message=short")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
