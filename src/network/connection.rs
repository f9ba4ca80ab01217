//! Connection Adapter
//!
//! Terminates the WebSocket handshake and turns the connection into a
//! [`Player`]. Identity comes from the request query:
//!
//! ```text
//! GET /play?ID=<id>&Name=<name>&LastActive=<RFC3339>
//! ```
//!
//! Each connection runs two tasks. The writer drains the player's outbound
//! channel into frames and stops after a close frame. The reader touches the
//! activity clock on every inbound frame; when it ends the connection is gone.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace};

use crate::game::player::{ActivityClock, Player, PlayerId};
use crate::network::protocol::{ClientMessage, Outbound};

/// How long to wait for the peer's close reply after our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// CONNECT PARAMETERS
// =============================================================================

/// Handshake validation errors. The message is returned to the client with
/// HTTP 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// No `ID` parameter.
    #[error("Missing userId")]
    MissingId,

    /// No `Name` parameter.
    #[error("Missing name")]
    MissingName,

    /// No `LastActive` parameter.
    #[error("Missing lastActive")]
    MissingLastActive,

    /// `LastActive` is not RFC 3339.
    #[error("Invalid LastActive timestamp")]
    InvalidLastActive,
}

/// Identity supplied by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Player identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Client-reported time of last activity.
    pub last_active: DateTime<Utc>,
}

impl ConnectParams {
    /// Parse the request query string. Empty values count as missing.
    pub fn from_query(query: Option<&str>) -> Result<Self, ConnectError> {
        let mut id = None;
        let mut name = None;
        let mut last_active = None;

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "ID" => id = id.or(Some(value.into_owned())),
                "Name" => name = name.or(Some(value.into_owned())),
                "LastActive" => last_active = last_active.or(Some(value.into_owned())),
                _ => {}
            }
        }

        let id = id.ok_or(ConnectError::MissingId)?;
        let name = name.ok_or(ConnectError::MissingName)?;
        let last_active = last_active.ok_or(ConnectError::MissingLastActive)?;
        let last_active = DateTime::parse_from_rfc3339(&last_active)
            .map_err(|_| ConnectError::InvalidLastActive)?
            .with_timezone(&Utc);

        Ok(Self { id, name, last_active })
    }
}

fn reject(err: &ConnectError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Decrements the live connection count when a connection ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts WebSocket connections and wires them to [`Player`] handles.
#[derive(Debug, Clone)]
pub struct ConnectionAdapter {
    outbound_capacity: usize,
    active: Arc<AtomicUsize>,
}

impl ConnectionAdapter {
    /// Adapter whose players buffer up to `outbound_capacity` frames.
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            outbound_capacity: outbound_capacity.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connections currently open (handshake completed, reader running).
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Complete the handshake on `stream` and start the connection tasks.
    ///
    /// A request without valid identity is answered with HTTP 400 and
    /// surfaces here as an HTTP handshake error.
    pub async fn accept<S>(&self, stream: S, peer: SocketAddr) -> Result<Player, WsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut params = None;
        let callback = |request: &Request, response: Response| {
            match ConnectParams::from_query(request.uri().query()) {
                Ok(parsed) => {
                    params = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    info!("Rejecting connection from {}: {}", peer, e);
                    Err(reject(&e))
                }
            }
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let params = params
            .ok_or_else(|| WsError::Io(std::io::Error::other("handshake produced no identity")))?;

        info!("Player {} ({}) connected from {}", params.id, params.name, peer);

        let guard = ConnectionGuard::acquire(&self.active);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.outbound_capacity);
        let activity = ActivityClock::since(params.last_active);
        let player = Player::new(PlayerId::new(params.id), params.name, activity.clone(), tx);
        let player_id = player.id.clone();

        // Writer: outbound channel -> frames.
        let mut writer = tokio::spawn({
            let player_id = player_id.clone();
            async move {
                while let Some(outbound) = rx.recv().await {
                    match outbound {
                        Outbound::Message(message) => {
                            let text = match message.to_json() {
                                Ok(t) => t,
                                Err(e) => {
                                    error!("Failed to serialize message: {}", e);
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Outbound::Close { reason } => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: reason.into(),
                            };
                            if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
                                debug!("Close frame to {} not sent: {}", player_id, e);
                            }
                            return;
                        }
                    }
                }
                // Every handle dropped without a close notice.
                let _ = ws_sender.close().await;
            }
        });

        // Reader: activity tracking until the peer goes away.
        tokio::spawn(async move {
            let _guard = guard;

            loop {
                tokio::select! {
                    frame = ws_receiver.next() => match frame {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(message)) => {
                            activity.touch().await;
                            if let Message::Text(text) = message {
                                match ClientMessage::from_json(&text) {
                                    Ok(ClientMessage::Input { data }) => {
                                        trace!("Input from {}: {}", player_id, data)
                                    }
                                    Ok(ClientMessage::Heartbeat) => {
                                        trace!("Heartbeat from {}", player_id)
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", player_id, e)
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!("Read error for {}: {}", player_id, e);
                            break;
                        }
                    },
                    _ = &mut writer => {
                        // Give the peer a moment to answer our close frame.
                        let _ = tokio::time::timeout(CLOSE_GRACE, async {
                            while let Some(Ok(frame)) = ws_receiver.next().await {
                                if frame.is_close() {
                                    break;
                                }
                            }
                        })
                        .await;
                        break;
                    }
                }
            }

            writer.abort();
            info!("Player {} disconnected", player_id);
        });

        Ok(player)
    }
}
