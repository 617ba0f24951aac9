//! Message Types für das Relay-Protokoll
//!
//! Jede Nachricht ist ein einzelner binärer WebSocket-Frame mit einem
//! bincode-serialisierten Enum.

use serde::{Deserialize, Serialize};

use super::client::SignalingError;

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Session-Control Aufrufe am Relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invocation {
    /// Neue Session anlegen, Antwort ist die Session-ID
    StartCallSession,
    /// Bestehender Session beitreten
    JoinCallSession { session_id: String },
}

impl Invocation {
    /// Methodenname wie ihn das Relay kennt
    pub fn method(&self) -> &'static str {
        match self {
            Invocation::StartCallSession => "StartCallSession",
            Invocation::JoinCallSession { .. } => "JoinCallSession",
        }
    }
}

/// Alle Nachrichten vom Client an das Relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request/Response (`Some`) oder Fire-and-Forget (`None`)
    Invoke {
        invocation_id: Option<u64>,
        invocation: Invocation,
    },

    /// Öffnet `BroadcastAudioStream` für eine Session
    StreamInvocation { stream_id: String, session_id: String },

    /// Ein Uplink-Frame (PCM16 Little Endian)
    StreamItem {
        stream_id: String,
        sender_id: String,
        chunk: Vec<u8>,
    },

    /// Sauberes Half-Close des Uplinks
    StreamComplete { stream_id: String },
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Erster Frame nach dem Verbindungsaufbau, vergibt die Peer-ID
    Welcome { peer_id: String },

    /// Antwort auf ein `Invoke` mit ID
    Completion {
        invocation_id: u64,
        result: Option<String>,
        error: Option<String>,
    },

    /// Eingehender Anruf
    IncomingCall { phone_number: String },

    /// Downlink-Audio eines Session-Teilnehmers
    ReceiveAudioChunk { chunk: Vec<u8>, sender_id: String },

    /// Keep-Alive
    Ping,
}

// ============================================================================
// FRAMING
// ============================================================================

pub fn encode_client(msg: &ClientMessage) -> Result<Vec<u8>, SignalingError> {
    bincode::serialize(msg).map_err(|e| SignalingError::Protocol(e.to_string()))
}

pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, SignalingError> {
    bincode::deserialize(bytes).map_err(|e| SignalingError::Protocol(e.to_string()))
}

pub fn encode_server(msg: &ServerMessage) -> Result<Vec<u8>, SignalingError> {
    bincode::serialize(msg).map_err(|e| SignalingError::Protocol(e.to_string()))
}

pub fn decode_server(bytes: &[u8]) -> Result<ServerMessage, SignalingError> {
    bincode::deserialize(bytes).map_err(|e| SignalingError::Protocol(e.to_string()))
}
