//! Upstream connector
//!
//! Holds the single privileged streaming connection to the tracking
//! backend and forwards every text message, untouched, to the hub.
//! Closures with code 1000, 1001 or 1006 schedule a reconnect with
//! exponential backoff; the attempt counter resets once a connection opens.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::SessionProvider;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ConnectorError;
use crate::hub::HubHandle;

/// Close codes after which the connector reconnects on its own
pub const RECONNECT_CODES: [u16; 3] = [1000, 1001, 1006];

/// Code recorded when the connection drops without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

type UpstreamStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Reconnect delay policy: `min(ceiling, floor * 2^attempt)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self { floor, ceiling }
    }

    /// Delay before reconnect number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.floor
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Connector settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Streaming endpoint, already mapped to ws/wss
    pub url: Url,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(base_url: &str, socket_path: &str) -> Result<Self, ConnectorError> {
        Ok(Self {
            url: streaming_url(base_url, socket_path)?,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
        })
    }
}

/// Map the backend's base address to its streaming endpoint.
///
/// `http` becomes `ws` and `https` becomes `wss`; the socket path replaces
/// any path on the base address.
pub fn streaming_url(base_url: &str, socket_path: &str) -> Result<Url, ConnectorError> {
    let base = Url::parse(base_url).map_err(|e| ConnectorError::InvalidUrl(e.to_string()))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectorError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };

    let mut text = format!("{}://", scheme);
    text.push_str(base.host_str().unwrap_or_default());
    if let Some(port) = base.port() {
        text.push_str(&format!(":{}", port));
    }
    text.push_str(socket_path);
    Url::parse(&text).map_err(|e| ConnectorError::InvalidUrl(e.to_string()))
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamPhase {
    Idle,
    Connecting,
    Open,
    Stopped,
}

/// Point-in-time connector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub phase: UpstreamPhase,
    /// Consecutive failed or closed cycles since the last successful open
    pub attempt: u32,
    /// Delay of the pending reconnect, if one is scheduled
    pub next_retry: Option<Duration>,
}

struct ConnectorState {
    phase: UpstreamPhase,
    attempt: u32,
    next_retry: Option<Duration>,
    /// Bumped by `stop`; callbacks from older tasks are ignored
    generation: u64,
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    close_signal: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: UpstreamConfig,
    session: Arc<dyn SessionProvider>,
    sink: HubHandle,
    state: Mutex<ConnectorState>,
}

/// Handle to the upstream connector; clones share one connection
#[derive(Clone)]
pub struct UpstreamConnector {
    inner: Arc<Inner>,
}

impl UpstreamConnector {
    pub fn new(config: UpstreamConfig, session: Arc<dyn SessionProvider>, sink: HubHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session,
                sink,
                state: Mutex::new(ConnectorState {
                    phase: UpstreamPhase::Idle,
                    attempt: 0,
                    next_retry: None,
                    generation: 0,
                    connection: None,
                    reconnect: None,
                    close_signal: None,
                }),
            }),
        }
    }

    /// Start connecting unless a connection is open or already being made.
    ///
    /// A pending reconnect timer is cancelled in favour of connecting now.
    pub fn ensure_connection(&self) {
        self.inner.ensure_connection();
    }

    /// Close the connection, cancel any pending reconnect and reset counters
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        // An open connection sends its own close frame; anything earlier is cut short.
        if let Some(signal) = state.close_signal.take() {
            let _ = signal.send(());
        }
        if let Some(task) = state.connection.take() {
            if state.phase != UpstreamPhase::Open {
                task.abort();
            }
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        state.phase = UpstreamPhase::Stopped;
        state.attempt = 0;
        state.next_retry = None;
        info!(target_url = %self.inner.config.url, "Upstream connector stopped");
    }

    pub fn status(&self) -> UpstreamStatus {
        let state = self.inner.state.lock();
        UpstreamStatus {
            phase: state.phase,
            attempt: state.attempt,
            next_retry: state.next_retry,
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.config.url
    }
}

impl Inner {
    fn ensure_connection(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if matches!(state.phase, UpstreamPhase::Connecting | UpstreamPhase::Open) {
            debug!("Upstream connection already in progress");
            return;
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        state.next_retry = None;
        state.phase = UpstreamPhase::Connecting;

        let generation = state.generation;
        let (close_tx, close_rx) = oneshot::channel();
        state.close_signal = Some(close_tx);
        let inner = self.clone();
        state.connection = Some(tokio::spawn(async move {
            inner.run(generation, close_rx).await;
        }));
    }

    async fn run(self: Arc<Self>, generation: u64, close_rx: oneshot::Receiver<()>) {
        let credential = match self.session.credential().await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                warn!(target_url = %self.config.url, "Upstream credential unavailable");
                self.connect_failed(generation);
                return;
            }
            Err(e) => {
                warn!(
                    target_url = %self.config.url,
                    error = %e,
                    "Failed to obtain upstream credential"
                );
                self.connect_failed(generation);
                return;
            }
        };

        info!(target_url = %self.config.url, "Connecting to upstream");
        let stream = match self.connect(&credential).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target_url = %self.config.url, error = %e, "Upstream connection failed");
                self.connect_failed(generation);
                return;
            }
        };

        if !self.opened(generation) {
            return;
        }
        let (mut write, mut read) = stream.split();
        let mut close_rx = close_rx;

        let code = loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let frame = CloseFrame {
                        code: WsCloseCode::Normal,
                        reason: "relay stopping".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Failed to send upstream close");
                    }
                    return;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.forward(text.to_string()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => self.forward(text),
                        Err(_) => {
                            debug!(len = data.len(), "Ignoring non-UTF-8 binary upstream message")
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target_url = %self.config.url, error = %e, "Upstream stream error");
                        break ABNORMAL_CLOSURE;
                    }
                    None => break ABNORMAL_CLOSURE,
                },
            }
        };

        self.closed(generation, code);
    }

    fn forward(&self, message: String) {
        if self.sink.upstream(message).is_err() {
            warn!(target_url = %self.config.url, "Relay hub gone, dropping upstream message");
        }
    }

    async fn connect(
        &self,
        credential: &fleet_core::Credential,
    ) -> Result<UpstreamStream, ConnectorError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let (name, value) = credential.header();
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ConnectorError::InvalidCredential(e.to_string()))?;
        request.headers_mut().insert(name, value);

        let timeout = self.config.connect_timeout;
        let (stream, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectorError::Timeout(timeout))??;
        Ok(stream)
    }

    /// Record a successful open. Returns false if the connector was stopped meanwhile.
    fn opened(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.phase = UpstreamPhase::Open;
        state.attempt = 0;
        state.next_retry = None;
        info!(target_url = %self.config.url, "Upstream connection open");
        true
    }

    fn connect_failed(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.connection = None;
        state.close_signal = None;
        self.schedule_reconnect(&mut state);
    }

    fn closed(self: &Arc<Self>, generation: u64, code: u16) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.connection = None;
        state.close_signal = None;

        if RECONNECT_CODES.contains(&code) {
            warn!(target_url = %self.config.url, code, "Upstream connection closed");
            self.schedule_reconnect(&mut state);
        } else {
            error!(
                target_url = %self.config.url,
                code,
                "Upstream closed with unexpected code, not reconnecting"
            );
            state.phase = UpstreamPhase::Idle;
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ConnectorState) {
        let delay = self.config.backoff.delay(state.attempt);
        state.attempt = state.attempt.saturating_add(1);
        state.phase = UpstreamPhase::Idle;
        state.next_retry = Some(delay);
        info!(
            attempt = state.attempt,
            delay_ms = delay.as_millis() as u64,
            "Upstream reconnect scheduled"
        );

        let generation = state.generation;
        let inner = self.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                state.reconnect = None;
                state.next_retry = None;
            }
            inner.ensure_connection();
        }));
    }
}
