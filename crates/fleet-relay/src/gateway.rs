//! Downstream gateway
//!
//! Accepts viewer connections on a plain TCP listener, performs the
//! upgrade handshake by hand and then runs one reader and one writer task
//! per connection. The reader answers pings and close frames; everything
//! the client receives otherwise comes from the hub through its outbound
//! channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_core::{AuthContext, AuthError, TokenVerifier};
use fleet_frame::{
    accept_key, close_code, encode_close, encode_frame, encode_text, CloseCode, FrameReader,
    Message, Opcode,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::HandshakeError;
use crate::hub::HubHandle;
use crate::registry::{Client, ClientId, Outbound};

/// First frame every accepted client receives
pub const READY_MESSAGE: &str = r#"{"type":"ready"}"#;

/// Gateway settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The only path that accepts upgrades
    pub path: String,
    /// Largest inbound message accepted from a client
    pub max_frame_bytes: usize,
    /// Largest request head accepted during the handshake
    pub max_handshake_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: "/api/socket".to_string(),
            max_frame_bytes: 64 * 1024,
            max_handshake_bytes: 8 * 1024,
        }
    }
}

/// Parsed HTTP request head of an upgrade attempt
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse a request head (everything before the blank line)
    pub fn parse(head: &str) -> Result<Self, HandshakeError> {
        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty request".into()))?;

        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) if parts.next().is_none() => (m, t, v),
            _ => {
                return Err(HandshakeError::Malformed(format!(
                    "bad request line: {}",
                    request_line
                )))
            }
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HandshakeError::Malformed(format!("unsupported version: {}", version)));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header: {}", line)))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
            headers,
        })
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Decoded value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }
}

/// Check an upgrade request and authenticate its caller.
///
/// Returns the caller's context and handshake key.
pub fn authorize(
    request: &UpgradeRequest,
    config: &GatewayConfig,
    verifier: &dyn TokenVerifier,
) -> Result<(AuthContext, String), HandshakeError> {
    if request.path != config.path {
        return Err(HandshakeError::NotFound(request.path.clone()));
    }
    if request.method != "GET" {
        return Err(HandshakeError::Method(request.method.clone()));
    }
    if !request.header_has_token("upgrade", "websocket") {
        return Err(HandshakeError::NotUpgrade);
    }

    let token = request
        .query_param("token")
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Missing)?;
    let auth = verifier.verify(&token)?;

    let key = request
        .header("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok((auth, key.to_string()))
}

/// The 101 response: status line plus exactly three headers
pub fn switching_protocols(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

fn rejection(status_line: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        status_line
    )
}

/// Read up to the end of the request head.
///
/// Returns the head and any bytes read past it, which already belong to
/// the frame stream.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<(String, Vec<u8>), HandshakeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        // Resume the search a few bytes back in case the terminator straddles reads
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf[search_from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            let end = search_from + pos;
            if end > max {
                return Err(HandshakeError::HeadTooLarge(max));
            }
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            let head = String::from_utf8(buf)
                .map_err(|_| HandshakeError::Malformed("request head is not UTF-8".into()))?;
            return Ok((head, leftover));
        }
        if buf.len() > max {
            return Err(HandshakeError::HeadTooLarge(max));
        }
    }
}

/// Accepts and serves downstream connections
pub struct Gateway {
    config: GatewayConfig,
    verifier: Arc<dyn TokenVerifier>,
    hub: HubHandle,
}

impl Gateway {
    pub fn new(config: GatewayConfig, verifier: Arc<dyn TokenVerifier>, hub: HubHandle) -> Self {
        Self {
            config,
            verifier,
            hub,
        }
    }

    /// Accept connections until `shutdown` flips to true.
    ///
    /// Connection tasks still running at that point are aborted, and this
    /// returns only once they have all finished.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        connections.spawn(async move { gateway.handle(stream, peer).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        debug!(open = connections.len(), "Gateway stopped accepting");
        connections.shutdown().await;
    }

    async fn handle(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let (auth, key, leftover) = match self.handshake(&mut stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(peer = %peer, path = %self.config.path, reason = %e, "Upgrade rejected");
                if let Some(status) = e.status_line() {
                    let _ = stream.write_all(rejection(status).as_bytes()).await;
                }
                let _ = stream.shutdown().await;
                return;
            }
        };

        if let Err(e) = stream.write_all(switching_protocols(&key).as_bytes()).await {
            warn!(peer = %peer, error = %e, "Failed to complete handshake");
            return;
        }

        let id = ClientId::new();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        // Queued before registration so it precedes any relayed message
        let _ = tx.send(Outbound::Frame(Bytes::from(encode_text(READY_MESSAGE))));
        tokio::spawn(write_loop(write_half, rx, id));

        debug!(client_id = %id, peer = %peer, subject = %auth.subject_id, "Handshake complete");
        if self.hub.register(Client::new(id, auth, tx.clone())).is_err() {
            let _ = tx.send(Outbound::Close(CloseCode::Away));
            return;
        }

        self.read_loop(read_half, leftover, &tx, id).await;
        let _ = self.hub.unregister(id);
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(AuthContext, String, Vec<u8>), HandshakeError> {
        let (head, leftover) = read_head(stream, self.config.max_handshake_bytes).await?;
        let request = UpgradeRequest::parse(&head)?;
        let (auth, key) = authorize(&request, &self.config, self.verifier.as_ref())?;
        Ok((auth, key, leftover))
    }

    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        leftover: Vec<u8>,
        tx: &mpsc::UnboundedSender<Outbound>,
        id: ClientId,
    ) {
        let mut frames = FrameReader::new(self.config.max_frame_bytes);
        frames.push(&leftover);
        let mut buf = vec![0u8; 4096];

        loop {
            loop {
                match frames.next_message() {
                    Ok(Some(message)) => {
                        if !on_message(message, tx, id) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client_id = %id, error = %e, "Protocol error, closing");
                        let _ = tx.send(Outbound::Close(e.close_code()));
                        return;
                    }
                }
            }

            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(client_id = %id, "Connection closed by peer");
                    return;
                }
                Ok(n) => frames.push(&buf[..n]),
                Err(e) => {
                    debug!(client_id = %id, error = %e, "Read failed");
                    return;
                }
            }
        }
    }
}

/// Handle one inbound message. Returns false once the connection is closing.
fn on_message(message: Message, tx: &mpsc::UnboundedSender<Outbound>, id: ClientId) -> bool {
    if !message.masked {
        debug!(client_id = %id, opcode = %message.opcode, "Accepting unmasked client frame");
    }

    match message.opcode {
        Opcode::Close => {
            let code = close_code(&message.payload)
                .map(CloseCode::from)
                .unwrap_or(CloseCode::Normal);
            info!(client_id = %id, code = u16::from(code), "Client closed connection");
            let _ = tx.send(Outbound::Close(code));
            false
        }
        Opcode::Ping => {
            let pong = encode_frame(&message.payload, Opcode::Pong);
            tx.send(Outbound::Frame(Bytes::from(pong))).is_ok()
        }
        Opcode::Text | Opcode::Binary => {
            debug!(client_id = %id, len = message.payload.len(), "Ignoring client data message");
            true
        }
        Opcode::Pong | Opcode::Continuation => true,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    id: ClientId,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(client_id = %id, error = %e, "Write failed");
                    break;
                }
            }
            Outbound::Close(code) => {
                let _ = writer.write_all(&encode_close(code, "")).await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
