//! Verbindung zum Relay
//!
//! Ein `Connector` baut genau eine Verbindung auf und liefert sie als
//! `RelayLink` (zwei Channels plus die vom Relay vergebene Peer-ID).
//! Produktiv läuft das über WebSocket, Tests setzen In-Memory-Links ein.

use super::client::SignalingError;
use super::messages::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Zustand der persistenten Relay-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

// ============================================================================
// RELAY LINK
// ============================================================================

/// Eine aufgebaute Verbindung
///
/// Wird `outbound` gedroppt, schließt der Connector die Verbindung.
/// `inbound` endet, sobald die Verbindung weg ist.
#[derive(Debug)]
pub struct RelayLink {
    pub peer_id: String,
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
}

/// Baut Verbindungen zum Relay auf
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<RelayLink, SignalingError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// Connector über WebSocket (binäre Frames)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    handshake_timeout: Duration,
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new(url: String, handshake_timeout: Duration, capacity: usize) -> Self {
        Self {
            url,
            handshake_timeout,
            capacity: capacity.max(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<RelayLink, SignalingError> {
        tracing::info!("Connecting to relay: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(self.capacity);
        let (in_tx, mut in_rx) = mpsc::channel::<ServerMessage>(self.capacity);

        // Read-Task starten
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Binary(bytes)) => match decode_server(&bytes) {
                        Ok(server_msg) => {
                            if in_tx.send(server_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Dropping undecodable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            tracing::debug!("Relay read task finished");
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match encode_client(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!("Failed to encode relay message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Binary(bytes)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            tracing::debug!("Relay write task finished");
        });

        // Auf Welcome warten
        let first = tokio::time::timeout(self.handshake_timeout, in_rx.recv())
            .await
            .map_err(|_| SignalingError::Timeout("handshake".to_string()))?;

        match first {
            Some(ServerMessage::Welcome { peer_id }) => {
                tracing::info!("Connected to relay as peer {}", peer_id);
                Ok(RelayLink {
                    peer_id,
                    outbound: out_tx,
                    inbound: in_rx,
                })
            }
            Some(other) => Err(SignalingError::Protocol(format!(
                "expected welcome, got {:?}",
                other
            ))),
            None => Err(SignalingError::ConnectionFailed(
                "connection closed during handshake".to_string(),
            )),
        }
    }
}
