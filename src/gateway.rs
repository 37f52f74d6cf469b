// ABOUTME: Gateway transport abstraction and the WebSocket implementation over JSON frames.
// ABOUTME: Separates auth rejection (non-retryable) from transport failures (retryable).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::events::{EventKind, GatewayEvent};

/// Close code the platform uses for credential rejection.
const CLOSE_CODE_AUTH_FAILED: u16 = 4004;

/// Something the transport produced for the supervisor.
#[derive(Debug)]
pub enum TransportEvent {
    /// Server acknowledged the identify handshake
    Hello { heartbeat_interval_ms: Option<u64> },
    /// An application event to dispatch to extensions
    Event(GatewayEvent),
    /// Server acknowledged our last heartbeat
    HeartbeatAck,
    /// Server closed the connection
    Closed { reason: String },
}

/// Errors from establishing a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The session token was rejected; retrying cannot help
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Anything transient: DNS, TCP, TLS, handshake interruption
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// A factory for gateway sessions. The supervisor reconnects by asking for
/// a fresh connection; implementations carry the credentials.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn GatewayConnection>, ConnectError>;
}

/// One established session. Owned exclusively by the supervisor.
#[async_trait]
pub trait GatewayConnection: Send {
    /// Next transport event; `None` means the stream ended (transport drop).
    async fn next_event(&mut self) -> anyhow::Result<Option<TransportEvent>>;

    async fn send_heartbeat(&mut self) -> anyhow::Result<()>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// WebSocket transport speaking the platform's JSON frame protocol.
pub struct WsTransport {
    url: String,
    token: String,
    application_id: u64,
    shard: Option<[u16; 2]>,
}

impl WsTransport {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        application_id: u64,
        shard: Option<[u16; 2]>,
    ) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            application_id,
            shard,
        }
    }
}

#[async_trait]
impl GatewayTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn GatewayConnection>, ConnectError> {
        let (mut ws, _response) = connect_async(&self.url)
            .await
            .map_err(|e| ConnectError::Transport(anyhow::anyhow!("websocket connect: {}", e)))?;

        let identify = serde_json::json!({
            "op": "identify",
            "token": self.token,
            "application_id": self.application_id,
            "shard": self.shard,
        });
        ws.send(Message::text(identify.to_string()))
            .await
            .map_err(|e| ConnectError::Transport(anyhow::anyhow!("identify send: {}", e)))?;

        // The server answers identify with hello, or rejects the token.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                    Some(TransportEvent::Hello { .. }) => {
                        return Ok(Box::new(WsConnection { ws }));
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return Err(ConnectError::Transport(anyhow::anyhow!(
                            "closed during handshake: {}",
                            reason
                        )));
                    }
                    _ => continue,
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((0, String::new()));
                    if code == CLOSE_CODE_AUTH_FAILED {
                        return Err(ConnectError::AuthRejected(reason));
                    }
                    return Err(ConnectError::Transport(anyhow::anyhow!(
                        "closed during handshake: code {} {}",
                        code,
                        reason
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ConnectError::Transport(anyhow::anyhow!(
                        "handshake read: {}",
                        e
                    )));
                }
                None => {
                    return Err(ConnectError::Transport(anyhow::anyhow!(
                        "stream ended during handshake"
                    )));
                }
            }
        }
    }
}

struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl GatewayConnection for WsConnection {
    async fn next_event(&mut self) -> anyhow::Result<Option<TransportEvent>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_frame(text.as_str()) {
                        return Ok(Some(event));
                    }
                    // Unknown op codes are skipped, not errors
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("code {}: {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    return Ok(Some(TransportEvent::Closed { reason }));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => anyhow::bail!("websocket read: {}", e),
                None => return Ok(None),
            }
        }
    }

    async fn send_heartbeat(&mut self) -> anyhow::Result<()> {
        self.ws
            .send(Message::text(r#"{"op":"heartbeat"}"#))
            .await
            .map_err(|e| anyhow::anyhow!("heartbeat send: {}", e))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.ws.close(None).await.ok();
        Ok(())
    }
}

/// Decode one JSON text frame into a transport event. Unknown op codes
/// return None and are skipped by the read loop.
fn parse_frame(text: &str) -> Option<TransportEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("op").and_then(|op| op.as_str())? {
        "hello" => Some(TransportEvent::Hello {
            heartbeat_interval_ms: value.get("heartbeat_interval_ms").and_then(|v| v.as_u64()),
        }),
        "heartbeat_ack" => Some(TransportEvent::HeartbeatAck),
        "dispatch" => {
            let kind = EventKind::from_code(value.get("t").and_then(|t| t.as_str())?);
            let payload = value.get("d").cloned().unwrap_or(serde_json::Value::Null);
            Some(TransportEvent::Event(GatewayEvent::new(kind, payload)))
        }
        "close" => Some(TransportEvent::Closed {
            reason: value
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("server close")
                .to_string(),
        }),
        _ => None,
    }
}
