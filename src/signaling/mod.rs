//! Signaling Module - Relay Client
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Verbindung aufbauen und halten (Reconnect mit festem Abstand)
//! - Session-Control Aufrufe (Request/Response)
//! - Audio-Uplink und Downlink mit Self-Echo Filter
//!

mod client;
mod connection;
mod messages;
mod resilience;

pub use client::{is_self_echo, RelayClient, RelayEvent, SignalingError, Uplink};
pub use connection::{ConnectionState, Connector, RelayLink, WebSocketConnector};
pub use messages::*;
pub use resilience::{RetryPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY};
