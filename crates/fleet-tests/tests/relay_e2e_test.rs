//! End-to-end tests for the fleet relay
//!
//! Each test runs the full path:
//! 1. Start a fake tracking backend on loopback
//! 2. Start a relay pointed at it
//! 3. Connect viewers over raw TCP and perform the upgrade by hand
//! 4. Push telemetry from the backend and check what each viewer receives
//!
//! Run with: cargo test -p fleet-tests --test relay_e2e_test

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleet_core::{Credential, TenantId};
use fleet_frame::{accept_key, close_code, decode_frame, encode_masked_frame, Frame, Opcode};
use fleet_relay::{
    sign_token, DeviceOwnership, GatewayConfig, JwtTokenVerifier, OwnershipResolver, RelayConfig,
    RelayService, SessionClaims, StaticDeviceRegistry, StaticSessionProvider, UpstreamConfig,
    UpstreamPhase, READY_MESSAGE,
};
use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

const SECRET: &[u8] = b"e2e-secret";
const SOCKET_PATH: &str = "/api/socket";
const HANDSHAKE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const UPSTREAM_COOKIE: &str = "upstream-session";
const QUIET: Duration = Duration::from_millis(300);
const PATIENCE: Duration = Duration::from_secs(5);

// =============================================================================
// Fake tracking backend
// =============================================================================

/// One accepted upstream connection and the cookie it presented
struct UpstreamPeer {
    cookie: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl UpstreamPeer {
    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        };
        self.ws.send(WsMessage::Close(Some(frame))).await.unwrap();
    }

    /// Next close code sent by the relay, skipping anything else
    async fn next_close(&mut self) -> Option<u16> {
        let wait = async {
            while let Some(Ok(message)) = self.ws.next().await {
                if let WsMessage::Close(frame) = message {
                    return frame.map(|f| u16::from(f.code));
                }
            }
            None
        };
        tokio::time::timeout(PATIENCE, wait).await.ok().flatten()
    }
}

struct FakeUpstream {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<UpstreamPeer>,
    task: JoinHandle<()>,
}

impl FakeUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, peers) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut cookie = None;
                let callback = |request: &Request,
                                response: Response|
                 -> Result<Response, ErrorResponse> {
                    cookie = request
                        .headers()
                        .get("cookie")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    Ok(response)
                };
                let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
                if let Ok(ws) = accepted {
                    if tx.send(UpstreamPeer { cookie, ws }).is_err() {
                        return;
                    }
                }
            }
        });

        Self { addr, peers, task }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn next_peer(&mut self) -> Option<UpstreamPeer> {
        self.next_peer_within(PATIENCE).await
    }

    async fn next_peer_within(&mut self, wait: Duration) -> Option<UpstreamPeer> {
        tokio::time::timeout(wait, self.peers.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Relay under test
// =============================================================================

fn registry() -> StaticDeviceRegistry {
    let device = |upstream: &str, unique: &str, tenant: &str| DeviceOwnership {
        upstream_id: Some(upstream.to_string()),
        unique_id: Some(unique.to_string()),
        tenant: TenantId::from(tenant),
    };
    StaticDeviceRegistry::new(vec![
        device("10", "356938035643809", "acme"),
        device("11", "356938035643810", "globex"),
    ])
}

fn relay_for(upstream: &FakeUpstream, floor: Duration) -> Arc<RelayService> {
    let mut upstream_config = UpstreamConfig::new(&upstream.base_url(), SOCKET_PATH).unwrap();
    upstream_config.backoff.floor = floor;
    upstream_config.backoff.ceiling = floor * 8;
    upstream_config.connect_timeout = Duration::from_secs(2);

    Arc::new(RelayService::new(
        RelayConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            gateway: GatewayConfig::default(),
            upstream: upstream_config,
        },
        Arc::new(JwtTokenVerifier::new(SECRET, vec!["admin".to_string()], 0)),
        Arc::new(StaticSessionProvider::new(Credential::Cookie {
            name: "JSESSIONID".into(),
            value: UPSTREAM_COOKIE.into(),
        })),
        OwnershipResolver::from_registry(Arc::new(registry())),
    ))
}

/// Relay plus fake backend, with the upstream connection already accepted
struct Harness {
    upstream: FakeUpstream,
    peer: UpstreamPeer,
    relay: Arc<RelayService>,
    addr: SocketAddr,
}

impl Harness {
    async fn start() -> Self {
        Self::with_floor(Duration::from_secs(30)).await
    }

    async fn with_floor(floor: Duration) -> Self {
        let mut upstream = FakeUpstream::start().await;
        let relay = relay_for(&upstream, floor);
        let addr = relay.start().await.unwrap();
        let peer = upstream.next_peer().await.expect("relay never connected upstream");
        let harness = Self {
            upstream,
            peer,
            relay,
            addr,
        };
        harness.wait_for_upstream(UpstreamPhase::Open).await;
        harness
    }

    /// The server side finishes its accept before the relay records the open
    async fn wait_for_upstream(&self, phase: UpstreamPhase) {
        let relay = self.relay.clone();
        let reached = wait_for(
            || {
                let relay = relay.clone();
                async move { relay.upstream_status().map(|s| s.phase) == Some(phase) }
            },
            PATIENCE,
        )
        .await;
        assert!(reached, "upstream never reached {:?}", phase);
    }

    async fn client_count(&self) -> usize {
        self.relay.snapshot().await.map(|s| s.clients).unwrap_or(0)
    }

    async fn wait_for_clients(&self, expected: usize) {
        let relay = self.relay.clone();
        let reached = wait_for(
            || {
                let relay = relay.clone();
                async move {
                    relay
                        .snapshot()
                        .await
                        .map(|s| s.clients == expected)
                        .unwrap_or(false)
                }
            },
            PATIENCE,
        )
        .await;
        assert!(reached, "registry never reached {} clients", expected);
    }

    /// Connect a viewer and wait until the hub has registered it
    async fn viewer(&self, token: &str) -> Viewer {
        let before = self.client_count().await;
        let mut viewer = Viewer::connect(self.addr, token).await;
        let ready = viewer.next_frame(PATIENCE).await.expect("no ready frame");
        assert_eq!(ready.payload, READY_MESSAGE.as_bytes());
        self.wait_for_clients(before + 1).await;
        viewer
    }
}

async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn token(tenant: Option<&str>, role: Option<&str>) -> String {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
    sign_token(
        SECRET,
        &SessionClaims {
            sub: "viewer".into(),
            tenant_id: tenant.map(String::from),
            role: role.map(String::from),
            exp,
        },
    )
    .unwrap()
}

// =============================================================================
// Raw viewer
// =============================================================================

/// Response head of an upgrade attempt
struct HandshakeResponse {
    status_line: String,
    headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn upgrade_request(target: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        target, HANDSHAKE_KEY
    )
}

/// Send a request head and read the response head
async fn handshake(addr: SocketAddr, request: &str) -> (HandshakeResponse, TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = tokio::time::timeout(PATIENCE, stream.read(&mut chunk))
            .await
            .expect("handshake response timed out")
            .unwrap();
        assert!(n > 0, "connection closed before a response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..end].to_vec()).unwrap();
    let leftover = buf[end + 4..].to_vec();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    (
        HandshakeResponse {
            status_line,
            headers,
        },
        stream,
        leftover,
    )
}

struct Viewer {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Viewer {
    async fn connect(addr: SocketAddr, token: &str) -> Self {
        let target = format!("{}?token={}", SOCKET_PATH, token);
        let (response, stream, leftover) = handshake(addr, &upgrade_request(&target)).await;
        assert_eq!(response.status_line, "HTTP/1.1 101 Switching Protocols");
        Self {
            stream,
            buf: leftover,
        }
    }

    async fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        let frame = encode_masked_frame(payload, opcode, [0x1f, 0x2e, 0x3d, 0x4c]);
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Next whole frame, or None if nothing arrives in time or the socket closes
    async fn next_frame(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut chunk = [0u8; 4096];
        loop {
            match decode_frame(&self.buf) {
                Ok(decoded) => {
                    self.buf.drain(..decoded.consumed);
                    return Some(decoded.frame);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => panic!("relay sent a malformed frame: {}", e),
            }

            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn next_json(&mut self, wait: Duration) -> Option<Value> {
        let frame = self.next_frame(wait).await?;
        assert_eq!(frame.opcode, Opcode::Text);
        Some(serde_json::from_slice(&frame.payload).unwrap())
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_upstream_connection_carries_session_cookie() {
    let harness = Harness::start().await;
    assert_eq!(
        harness.peer.cookie.as_deref(),
        Some("JSESSIONID=upstream-session")
    );
    assert_eq!(
        harness.relay.upstream_status().map(|s| s.phase),
        Some(UpstreamPhase::Open)
    );
    harness.relay.stop().await;
}

#[tokio::test]
async fn test_valid_handshake_registers_viewer_and_sends_ready() {
    let harness = Harness::start().await;

    let target = format!("{}?token={}", SOCKET_PATH, token(Some("acme"), None));
    let (response, stream, leftover) = handshake(harness.addr, &upgrade_request(&target)).await;

    assert_eq!(response.status_line, "HTTP/1.1 101 Switching Protocols");
    assert_eq!(response.headers.len(), 3);
    assert_eq!(response.header("Upgrade"), Some("websocket"));
    assert_eq!(response.header("Connection"), Some("Upgrade"));
    let expected_accept = accept_key(HANDSHAKE_KEY);
    assert_eq!(
        response.header("Sec-WebSocket-Accept"),
        Some(expected_accept.as_str())
    );

    let mut viewer = Viewer {
        stream,
        buf: leftover,
    };
    let ready = viewer.next_json(PATIENCE).await.unwrap();
    assert_eq!(ready, json!({"type": "ready"}));

    harness.wait_for_clients(1).await;
    let snapshot = harness.relay.snapshot().await.unwrap();
    assert_eq!(snapshot.scoped_clients, 1);

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_missing_or_invalid_token_is_unauthorized() {
    let harness = Harness::start().await;

    let (response, _, _) = handshake(harness.addr, &upgrade_request(SOCKET_PATH)).await;
    assert_eq!(response.status_line, "HTTP/1.1 401 Unauthorized");

    let target = format!("{}?token=not-a-token", SOCKET_PATH);
    let (response, _, _) = handshake(harness.addr, &upgrade_request(&target)).await;
    assert_eq!(response.status_line, "HTTP/1.1 401 Unauthorized");

    let forged = {
        let exp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
        sign_token(
            b"someone-else",
            &SessionClaims {
                sub: "mallory".into(),
                tenant_id: None,
                role: Some("admin".into()),
                exp,
            },
        )
        .unwrap()
    };
    let target = format!("{}?token={}", SOCKET_PATH, forged);
    let (response, _, _) = handshake(harness.addr, &upgrade_request(&target)).await;
    assert_eq!(response.status_line, "HTTP/1.1 401 Unauthorized");

    assert_eq!(harness.client_count().await, 0);
    harness.relay.stop().await;
}

#[tokio::test]
async fn test_wrong_path_is_not_found() {
    let harness = Harness::start().await;

    let target = format!("/api/other?token={}", token(None, Some("admin")));
    let (response, _, _) = handshake(harness.addr, &upgrade_request(&target)).await;
    assert_eq!(response.status_line, "HTTP/1.1 404 Not Found");

    assert_eq!(harness.client_count().await, 0);
    harness.relay.stop().await;
}

#[tokio::test]
async fn test_plain_http_request_is_bad_request() {
    let harness = Harness::start().await;

    let request = format!(
        "GET {}?token={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        SOCKET_PATH,
        token(None, None)
    );
    let (response, _, _) = handshake(harness.addr, &request).await;
    assert_eq!(response.status_line, "HTTP/1.1 400 Bad Request");

    harness.relay.stop().await;
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn test_scoped_viewers_only_see_their_devices() {
    let mut harness = Harness::start().await;
    let mut acme = harness.viewer(&token(Some("acme"), None)).await;
    let mut globex = harness.viewer(&token(Some("globex"), None)).await;

    harness
        .peer
        .send_json(json!({
            "positions": [
                {"id": 501, "deviceId": 10, "latitude": 52.52, "longitude": 13.40},
                {"id": 502, "deviceId": 99, "latitude": 48.85, "longitude": 2.35}
            ]
        }))
        .await;

    let received = acme.next_json(PATIENCE).await.unwrap();
    assert_eq!(
        received,
        json!({"positions": [{"id": 501, "deviceId": 10, "latitude": 52.52, "longitude": 13.40}]})
    );
    assert!(globex.next_frame(QUIET).await.is_none());

    // Next message belongs to globex; it must be the first thing globex sees
    harness
        .peer
        .send_json(json!({"devices": [{"id": 11, "name": "van", "status": "online"}]}))
        .await;

    let received = globex.next_json(PATIENCE).await.unwrap();
    assert_eq!(
        received,
        json!({"devices": [{"id": 11, "name": "van", "status": "online"}]})
    );
    assert!(acme.next_frame(QUIET).await.is_none());

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_unscoped_viewer_gets_raw_messages_in_order() {
    let mut harness = Harness::start().await;
    let mut admin = harness.viewer(&token(Some("acme"), Some("admin"))).await;

    let messages = [
        json!({"positions": [{"deviceId": 10}]}),
        json!({"events": [{"type": "alarm", "deviceId": 77}]}),
        json!({"somethingElse": true}),
    ];
    for message in &messages {
        harness.peer.send_json(message.clone()).await;
    }

    for expected in &messages {
        let frame = admin.next_frame(PATIENCE).await.unwrap();
        assert_eq!(frame.payload, expected.to_string().as_bytes());
    }

    let relay = harness.relay.clone();
    assert!(
        wait_for(
            || {
                let relay = relay.clone();
                async move { relay.messages_relayed() == 3 }
            },
            PATIENCE
        )
        .await
    );

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_binary_upstream_messages_are_relayed_as_text() {
    let mut harness = Harness::start().await;
    let mut admin = harness.viewer(&token(None, Some("admin"))).await;

    let payload = json!({"positions": [{"deviceId": 10}]}).to_string();
    harness
        .peer
        .ws
        .send(WsMessage::Binary(payload.clone().into_bytes().into()))
        .await
        .unwrap();
    // Not UTF-8, dropped without disturbing the stream
    harness
        .peer
        .ws
        .send(WsMessage::Binary(vec![0xff, 0xfe].into()))
        .await
        .unwrap();
    harness.peer.send_json(json!({"events": []})).await;

    let frame = admin.next_frame(PATIENCE).await.unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(frame.payload, payload.as_bytes());
    let next = admin.next_json(PATIENCE).await.unwrap();
    assert_eq!(next, json!({"events": []}));

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_events_resolved_by_unique_id() {
    let mut harness = Harness::start().await;
    let mut acme = harness.viewer(&token(Some("acme"), None)).await;

    harness
        .peer
        .send_json(json!({
            "events": [
                {"type": "geofenceEnter", "device": {"uniqueId": "356938035643809"}},
                {"type": "geofenceEnter", "device": {"uniqueId": "356938035643810"}}
            ]
        }))
        .await;

    let received = acme.next_json(PATIENCE).await.unwrap();
    assert_eq!(
        received,
        json!({"events": [{"type": "geofenceEnter", "device": {"uniqueId": "356938035643809"}}]})
    );

    harness.relay.stop().await;
}

// =============================================================================
// Control frames
// =============================================================================

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let harness = Harness::start().await;
    let mut viewer = harness.viewer(&token(None, None)).await;

    viewer.send(Opcode::Ping, b"are-you-there").await;
    let pong = viewer.next_frame(PATIENCE).await.unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"are-you-there");

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_close_is_echoed_and_viewer_removed() {
    let harness = Harness::start().await;
    let mut viewer = harness.viewer(&token(Some("acme"), None)).await;

    let mut payload = 4000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"leaving");
    viewer.send(Opcode::Close, &payload).await;

    let echo = viewer.next_frame(PATIENCE).await.unwrap();
    assert_eq!(echo.opcode, Opcode::Close);
    assert_eq!(close_code(&echo.payload), Some(4000));

    harness.wait_for_clients(0).await;
    harness.relay.stop().await;
}

#[tokio::test]
async fn test_unmasked_text_frames_are_tolerated() {
    let mut harness = Harness::start().await;
    let mut viewer = harness.viewer(&token(None, None)).await;

    let frame = fleet_frame::encode_frame(b"hello relay", Opcode::Text);
    viewer.stream.write_all(&frame).await.unwrap();

    harness.peer.send_json(json!({"positions": []})).await;
    let frame = viewer.next_frame(PATIENCE).await.unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(harness.client_count().await, 1);

    harness.relay.stop().await;
}

// =============================================================================
// Upstream lifecycle
// =============================================================================

#[tokio::test]
async fn test_upstream_going_away_schedules_reconnect_at_floor() {
    let mut harness = Harness::start().await;

    harness.peer.close(1001).await;

    let relay = harness.relay.clone();
    let scheduled = wait_for(
        || {
            let relay = relay.clone();
            async move {
                relay
                    .upstream_status()
                    .map(|s| s.next_retry.is_some())
                    .unwrap_or(false)
            }
        },
        PATIENCE,
    )
    .await;
    assert!(scheduled);

    let status = harness.relay.upstream_status().unwrap();
    assert_eq!(status.phase, UpstreamPhase::Idle);
    assert_eq!(status.attempt, 1);
    assert_eq!(status.next_retry, Some(Duration::from_secs(30)));

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_unexpected_upstream_close_code_does_not_reconnect() {
    let mut harness = Harness::with_floor(Duration::from_millis(50)).await;

    harness.peer.close(4001).await;

    let relay = harness.relay.clone();
    let idle = wait_for(
        || {
            let relay = relay.clone();
            async move {
                relay
                    .upstream_status()
                    .map(|s| s.phase == UpstreamPhase::Idle)
                    .unwrap_or(false)
            }
        },
        PATIENCE,
    )
    .await;
    assert!(idle);
    assert_eq!(harness.relay.upstream_status().unwrap().next_retry, None);
    assert!(harness.upstream.next_peer_within(QUIET).await.is_none());

    // An explicit request still reconnects
    harness.relay.ensure_upstream();
    assert!(harness.upstream.next_peer().await.is_some());

    harness.relay.stop().await;
}

#[tokio::test]
async fn test_abnormal_drop_reconnects_and_relaying_resumes() {
    let harness = Harness::with_floor(Duration::from_millis(50)).await;
    let mut admin = harness.viewer(&token(None, Some("admin"))).await;
    let Harness {
        mut upstream,
        peer,
        relay,
        ..
    } = harness;

    // Dropping the socket without a close frame reads as 1006
    drop(peer);
    let mut peer = upstream.next_peer().await.expect("relay never reconnected");

    // A successful open resets the backoff
    let status_relay = relay.clone();
    let reset = wait_for(
        || {
            let relay = status_relay.clone();
            async move {
                relay
                    .upstream_status()
                    .map(|s| s.phase == UpstreamPhase::Open && s.attempt == 0)
                    .unwrap_or(false)
            }
        },
        PATIENCE,
    )
    .await;
    assert!(reset);

    peer.send_json(json!({"positions": [{"deviceId": 11}]})).await;
    let received = admin.next_json(PATIENCE).await.unwrap();
    assert_eq!(received, json!({"positions": [{"deviceId": 11}]}));

    relay.stop().await;
}

#[tokio::test]
async fn test_stop_closes_viewers_and_upstream() {
    let mut harness = Harness::start().await;
    let mut viewer = harness.viewer(&token(Some("globex"), None)).await;

    harness.relay.stop().await;

    let close = viewer.next_frame(PATIENCE).await.unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close_code(&close.payload), Some(1001));

    assert_eq!(harness.peer.next_close().await, Some(1000));
    assert!(!harness.relay.is_running());

    // Listener is gone
    assert!(TcpStream::connect(harness.addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewers_connecting_during_stop_are_closed_or_refused() {
    let harness = Harness::start().await;
    let mut settled = harness.viewer(&token(None, Some("admin"))).await;

    let addr = harness.addr;
    let target = format!("{}?token={}", SOCKET_PATH, token(Some("acme"), None));
    let request = upgrade_request(&target);
    let racers: Vec<_> = (0..8)
        .map(|_| {
            let request = request.clone();
            tokio::spawn(async move { frames_until_eof(addr, &request).await })
        })
        .collect();

    harness.relay.stop().await;

    let close = settled.next_frame(PATIENCE).await.unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close_code(&close.payload), Some(1001));

    for racer in racers {
        let frames = racer.await.unwrap();
        // Past the ready frame, the only thing a viewer may see is the going-away close
        for frame in frames.iter().skip(1) {
            assert_eq!(frame.opcode, Opcode::Close);
            assert_eq!(close_code(&frame.payload), Some(1001));
        }
    }
}

/// Attempt an upgrade and collect every frame sent before the socket closes
async fn frames_until_eof(addr: SocketAddr, request: &str) -> Vec<Frame> {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return Vec::new();
    };
    if stream.write_all(request.as_bytes()).await.is_err() {
        return Vec::new();
    }

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(PATIENCE, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => buf.extend_from_slice(&chunk[..n]),
            Ok(_) => break,
            Err(_) => panic!("socket still open after the relay stopped"),
        }
    }

    if !buf.starts_with(b"HTTP/1.1 101") {
        return Vec::new();
    }
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Vec::new();
    };
    let mut rest = &buf[end + 4..];
    let mut frames = Vec::new();
    while let Ok(decoded) = decode_frame(rest) {
        rest = &rest[decoded.consumed..];
        frames.push(decoded.frame);
    }
    frames
}
