//! Transport to the voice service.
//!
//! A [`Connector`] performs the handshake and hands back a [`Link`]: a pair
//! of channels the session loop uses without touching the socket directly.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, warn};

use voxlane_core::config::ServerConfig;
use voxlane_core::error::{Result, VoiceError};
use voxlane_core::protocol::{ClientFrame, PROTOCOL_VERSION, ServerFrame, server_error};

/// Contents of the server's `connected` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub client_id: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(ServerFrame),
    /// The transport is gone. No further events follow.
    Closed { reason: String },
}

/// An established connection.
///
/// Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct Link {
    pub hello: ServerHello,
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the handshake. Auth rejections return
    /// [`VoiceError::Auth`]; everything else is a [`VoiceError::Connection`].
    async fn connect(&self) -> Result<Link>;
}

/// WebSocket connector.
pub struct WsConnector {
    url: String,
    auth_token: Option<String>,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_token,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.resolve_auth_token(),
            config.handshake_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn handshake(&self) -> Result<Link> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Config(format!("invalid server url {}: {e}", self.url)))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| VoiceError::Config(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = connect_async(request).await.map_err(map_ws_error)?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        // The first text frame must be `connected` (or an error)
        let hello = loop {
            let msg = match ws_rx.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => {
                    return Err(VoiceError::Connection(
                        "connection closed during handshake".into(),
                    ));
                }
            };
            match msg {
                Message::Text(text) => match ServerFrame::parse(text.as_str()).map_err(|e| {
                    VoiceError::Connection(format!("malformed handshake frame: {e}"))
                })? {
                    ServerFrame::Connected {
                        client_id,
                        protocol_version,
                        capabilities,
                    } => {
                        break ServerHello {
                            client_id,
                            protocol_version,
                            capabilities,
                        };
                    }
                    ServerFrame::Error {
                        code,
                        message,
                        retry_after_ms,
                    } => {
                        return Err(match server_error(&code, &message, retry_after_ms) {
                            e @ (VoiceError::Auth(_) | VoiceError::QuotaExceeded { .. }) => e,
                            other => VoiceError::Connection(other.to_string()),
                        });
                    }
                    other => {
                        return Err(VoiceError::ProtocolViolation(format!(
                            "expected connected, got {}",
                            other.kind()
                        )));
                    }
                },
                Message::Close(frame) => {
                    return Err(VoiceError::Connection(format!(
                        "server closed during handshake: {frame:?}"
                    )));
                }
                _ => continue,
            }
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            warn!(
                server = hello.protocol_version,
                client = PROTOCOL_VERSION,
                "Protocol version mismatch"
            );
        }
        info!(client_id = %hello.client_id, capabilities = ?hello.capabilities, "Voice service connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: frames from the session onto the socket
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%e, "Failed to encode client frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            debug!("Link writer stopped");
        });

        // Reader: socket frames to the session
        tokio::spawn(async move {
            let reason = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => match ServerFrame::parse(text.as_str()) {
                        Ok(frame) => {
                            if inbound_tx.send(LinkEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(%e, "Ignoring malformed server frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("server closed: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            debug!(%reason, "Link reader stopped");
            let _ = inbound_tx.send(LinkEvent::Closed { reason });
        });

        Ok(Link {
            hello,
            outbound,
            inbound,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        debug!(url = %self.url, "Connecting to voice service");
        match tokio::time::timeout(self.handshake_timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::Connection(format!(
                "handshake timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> VoiceError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                VoiceError::Auth(format!("upgrade rejected: {status}"))
            } else {
                VoiceError::Connection(format!("upgrade failed: {status}"))
            }
        }
        other => VoiceError::Connection(other.to_string()),
    }
}
