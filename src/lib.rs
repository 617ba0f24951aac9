//! Relay Voice - Voice-Call Client über ein Relay
//!
//! Ein Voice-Call Client mit:
//! - Mikrofon-Capture und Playback über cpal
//! - PCM16-Audio über eine persistente WebSocket-Verbindung zum Relay
//! - Automatischem Reconnect mit festem Abstand
//! - Call-Session Zustandsmaschine (idle / ringing / active)

pub mod call_engine;
pub mod config;
pub mod lookup;
pub mod signaling;

use call_engine::{AudioBackend, CallEngine, CpalBackend};
use config::{ClientConfig, ConfigError};
use lookup::{CustomerDirectory, HttpCustomerDirectory, LookupError, NoDirectory};
use signaling::{Connector, RelayClient, WebSocketConnector};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert Logging (`RUST_LOG` plus Defaults). Mehrfache Aufrufe sind harmlos.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["relay_voice=debug", "tungstenite=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CLIENT CONTEXT
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Customer lookup setup failed: {0}")]
    Lookup(#[from] LookupError),
}

/// Besitzt Relay-Verbindung und Call Engine und verdrahtet sie
///
/// Muss innerhalb einer Tokio-Runtime erstellt werden.
pub struct VoiceClient {
    relay: Arc<RelayClient>,
    engine: Arc<CallEngine>,
    event_task: Option<JoinHandle<()>>,
}

impl VoiceClient {
    /// Erstellt den Client aus einzelnen Bausteinen
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioBackend>,
        directory: Arc<dyn CustomerDirectory>,
    ) -> Self {
        let relay = Arc::new(RelayClient::new(connector, config));
        let engine = Arc::new(CallEngine::new(
            Arc::clone(&relay),
            audio,
            directory,
            config,
        ));

        // Relay-Events -> Call Engine
        let event_task = relay
            .take_events()
            .map(|events| tokio::spawn(Arc::clone(&engine).run(events)));

        Self {
            relay,
            engine,
            event_task,
        }
    }

    /// Produktiver Client: WebSocket, cpal und (optional) HTTP-Lookup
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let connector = WebSocketConnector::new(
            config.ws_url()?,
            config.handshake_timeout(),
            config.uplink_capacity,
        );
        let audio = CpalBackend::new(config.sample_rate);
        let directory: Arc<dyn CustomerDirectory> = match &config.lookup_base_url {
            Some(base_url) => Arc::new(HttpCustomerDirectory::new(base_url)?),
            None => {
                tracing::info!("No customer lookup configured");
                Arc::new(NoDirectory)
            }
        };

        Ok(Self::new(
            config,
            Arc::new(connector),
            Arc::new(audio),
            directory,
        ))
    }

    /// Startet den Verbindungsaufbau zum Relay
    pub fn start(&self) {
        self.relay.start();
    }

    pub fn relay(&self) -> &Arc<RelayClient> {
        &self.relay
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    /// Legt auf, trennt die Verbindung und beendet die Event-Verarbeitung
    pub async fn shutdown(mut self) {
        self.engine.hang_up();
        self.relay.stop().await;
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        tracing::info!("Voice client shut down");
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for VoiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceClient")
            .field("relay", &self.relay)
            .field("engine", &self.engine)
            .finish()
    }
}
