//! Call Engine
//!
//! Zustandsmaschine einer Call-Session. Koordiniert Relay-Aufrufe,
//! Audio Capture/Playback und den Kunden-Lookup.
//!
//! ```text
//! Idle --IncomingCall--> Ringing --answer()--> Active
//!   |                       \--decline()--> Idle
//!   \--join(id)--> ActiveCustomer
//! Active | ActiveCustomer --hang_up()--> Idle
//! ```

use super::audio::{AudioBackend, AudioError, AudioSink, CaptureStream};
use super::codec;
use crate::config::ClientConfig;
use crate::lookup::{Customer, CustomerDirectory};
use crate::signaling::{RelayClient, RelayEvent, SignalingError, Uplink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Relay error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Cannot {action} while {phase}")]
    WrongPhase {
        action: &'static str,
        phase: CallPhase,
    },

    #[error("Another call transition is in progress")]
    TransitionInProgress,

    #[error("Call was ended before it became active")]
    Cancelled,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Phase der Call-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// Kein Anruf, keine Geräte belegt
    #[default]
    Idle,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Angenommener Anruf (Initiator der Session)
    Active,
    /// Beigetretene Session
    ActiveCustomer,
}

impl CallPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, CallPhase::Active | CallPhase::ActiveCustomer)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallPhase::Idle => "idle",
            CallPhase::Ringing => "ringing",
            CallPhase::Active => "active",
            CallPhase::ActiveCustomer => "active_customer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Joiner,
}

/// Gegenstelle einer Session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RemoteParty {
    pub phone_number: Option<String>,
    pub customer: Option<Customer>,
}

/// Die (einzige) aktive Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub role: CallRole,
    pub remote: RemoteParty,
    pub started_at: DateTime<Utc>,
}

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    CustomerResolved(Customer),
    LookupFailed(String),
    Error(String),
}

// ============================================================================
// PIPELINES
// ============================================================================

/// Geräte und Tasks einer aktiven Session
struct ActivePipelines {
    capture: CaptureStream,
    sink: AudioSink,
    uplink: Arc<Uplink>,
    pump: JoinHandle<()>,
}

impl ActivePipelines {
    /// Erst Auslieferung stoppen, dann Handles freigeben
    ///
    /// Der Uplink-Abschluss wartet auf das Ende des Pumps und auf Platz im
    /// Outbound-Channel, landet also hinter allen bereits gesendeten Frames.
    fn shutdown(self) {
        let ActivePipelines {
            mut capture,
            mut sink,
            uplink,
            pump,
        } = self;

        pump.abort();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = pump.await;
                    uplink.finish().await;
                });
            }
            Err(_) => uplink.complete(),
        }
        capture.close();
        sink.close();
    }
}

/// Capture -> PCM16 -> Uplink, bis das Mikrofon geschlossen wird
async fn uplink_pump(mut blocks: mpsc::Receiver<Vec<f32>>, uplink: Arc<Uplink>) {
    let mut degraded = false;
    while let Some(block) = blocks.recv().await {
        let frame = codec::encode(&block);
        match uplink.send(&frame).await {
            Ok(()) => degraded = false,
            Err(e) => {
                if !degraded {
                    tracing::warn!("Uplink {} dropping frames: {}", uplink.stream_id(), e);
                    degraded = true;
                }
            }
        }
    }
    tracing::debug!("Uplink pump for {} finished", uplink.stream_id());
}

#[derive(Default)]
struct EngineState {
    phase: CallPhase,
    incoming_number: String,
    customer: Option<Customer>,
    last_error: Option<String>,
    session: Option<CallSession>,
    pipelines: Option<ActivePipelines>,
    /// Wird bei hang_up/decline/IncomingCall erhöht; laufende Übergänge prüfen es
    epoch: u64,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Call Engine
pub struct CallEngine {
    relay: Arc<RelayClient>,
    audio: Arc<dyn AudioBackend>,
    directory: Arc<dyn CustomerDirectory>,
    block_size: usize,
    state: Arc<Mutex<EngineState>>,
    /// Session-Ownership: höchstens ein laufender answer/join
    transition: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        relay: Arc<RelayClient>,
        audio: Arc<dyn AudioBackend>,
        directory: Arc<dyn CustomerDirectory>,
        config: &ClientConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            relay,
            audio,
            directory,
            block_size: config.block_size,
            state: Arc::new(Mutex::new(EngineState::default())),
            transition: tokio::sync::Mutex::new(()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.state.lock().phase
    }

    /// Session-ID der aktiven Session, sonst leer
    pub fn call_id(&self) -> String {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default()
    }

    /// Rufnummer des eingehenden bzw. angenommenen Anrufs
    pub fn incoming_number(&self) -> String {
        self.state.lock().incoming_number.clone()
    }

    pub fn customer(&self) -> Option<Customer> {
        self.state.lock().customer.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn session(&self) -> Option<CallSession> {
        self.state.lock().session.clone()
    }

    /// Sind Mikrofon, Ausgabe und Uplink belegt?
    pub fn has_audio(&self) -> bool {
        self.state.lock().pipelines.is_some()
    }

    /// Verarbeitet Relay-Events bis der Channel endet
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        tracing::debug!("Relay event channel closed");
    }

    /// Verarbeitet ein einzelnes Relay-Event
    pub fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::IncomingCall { phone_number } => self.on_incoming_call(phone_number),
            RelayEvent::AudioChunk { samples, sender_id } => {
                let mut state = self.state.lock();
                match state.pipelines.as_mut() {
                    Some(pipelines) => {
                        let block = codec::decode(&samples);
                        pipelines.sink.schedule(&block);
                    }
                    None => tracing::trace!("No active sink, dropping chunk from {}", sender_id),
                }
            }
        }
    }

    /// Eingehender Anruf: nur aus `Idle` und ohne laufendes answer/join,
    /// startet den Kunden-Lookup
    fn on_incoming_call(&self, phone_number: String) {
        // Während eines Übergangs gehört die Session dem laufenden answer/join
        let Ok(_owner) = self.transition.try_lock() else {
            tracing::info!(
                "Ignoring incoming call from {} during call transition",
                phone_number
            );
            return;
        };

        let epoch = {
            let mut state = self.state.lock();
            if state.phase != CallPhase::Idle {
                tracing::info!(
                    "Ignoring incoming call from {} while {}",
                    phone_number,
                    state.phase
                );
                return;
            }
            state.phase = CallPhase::Ringing;
            state.incoming_number = phone_number.clone();
            state.customer = None;
            state.last_error = None;
            state.epoch += 1;
            state.epoch
        };
        self.emit(CallEvent::PhaseChanged(CallPhase::Ringing));

        let directory = Arc::clone(&self.directory);
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = directory.lookup(&phone_number).await;

            let mut s = state.lock();
            // Nur übernehmen, wenn der Anruf noch derselbe ist
            if s.epoch != epoch || s.incoming_number != phone_number {
                return;
            }
            match result {
                Ok(customer) => {
                    tracing::info!("Caller {} is {}", phone_number, customer.name);
                    s.customer = Some(customer.clone());
                    if let Some(session) = s.session.as_mut() {
                        session.remote.customer = Some(customer.clone());
                    }
                    drop(s);
                    let _ = event_tx.send(CallEvent::CustomerResolved(customer));
                }
                Err(e) => {
                    tracing::info!("Customer lookup for {} failed: {}", phone_number, e);
                    s.last_error = Some(e.to_string());
                    drop(s);
                    let _ = event_tx.send(CallEvent::LookupFailed(e.to_string()));
                }
            }
        });
    }

    /// Nimmt den klingelnden Anruf an
    ///
    /// Das Relay vergibt eine neue Session-ID. Bei Fehlern bleibt der
    /// Anruf in `Ringing`.
    pub async fn answer(&self) -> Result<String, CallEngineError> {
        let _owner = self
            .transition
            .try_lock()
            .map_err(|_| CallEngineError::TransitionInProgress)?;

        let (epoch, phone_number) = {
            let state = self.state.lock();
            match state.phase {
                CallPhase::Ringing => (state.epoch, state.incoming_number.clone()),
                phase if phase.is_active() => return Err(CallEngineError::AlreadyInCall),
                phase => {
                    return Err(CallEngineError::WrongPhase {
                        action: "answer",
                        phase,
                    })
                }
            }
        };

        tracing::info!("Answering call from {}", phone_number);

        let session_id = self
            .relay
            .start_call_session()
            .await
            .map_err(|e| self.fail(e.into()))?;

        self.activate(
            epoch,
            CallPhase::Ringing,
            session_id,
            CallRole::Initiator,
            Some(phone_number),
        )
        .await
    }

    /// Tritt einer bestehenden Session bei
    pub async fn join(&self, session_id: &str) -> Result<String, CallEngineError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(CallEngineError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }

        let _owner = self
            .transition
            .try_lock()
            .map_err(|_| CallEngineError::TransitionInProgress)?;

        let epoch = {
            let state = self.state.lock();
            match state.phase {
                CallPhase::Idle => state.epoch,
                phase if phase.is_active() => return Err(CallEngineError::AlreadyInCall),
                phase => {
                    return Err(CallEngineError::WrongPhase {
                        action: "join",
                        phase,
                    })
                }
            }
        };

        tracing::info!("Joining session {}", session_id);

        self.relay
            .join_call_session(session_id)
            .await
            .map_err(|e| self.fail(e.into()))?;

        self.activate(
            epoch,
            CallPhase::Idle,
            session_id.to_string(),
            CallRole::Joiner,
            None,
        )
        .await
    }

    /// Lehnt den klingelnden Anruf ab; es wurden keine Geräte belegt
    pub fn decline(&self) -> Result<(), CallEngineError> {
        {
            let mut state = self.state.lock();
            if state.phase != CallPhase::Ringing {
                return Err(CallEngineError::WrongPhase {
                    action: "decline",
                    phase: state.phase,
                });
            }
            tracing::info!("Call from {} declined", state.incoming_number);
            state.phase = CallPhase::Idle;
            state.incoming_number.clear();
            state.customer = None;
            state.last_error = None;
            state.epoch += 1;
        }
        self.emit(CallEvent::PhaseChanged(CallPhase::Idle));
        Ok(())
    }

    /// Beendet den Anruf. Idempotent, auch ohne belegte Geräte.
    pub fn hang_up(&self) {
        let (pipelines, changed) = {
            let mut state = self.state.lock();
            let changed = state.phase != CallPhase::Idle;
            state.phase = CallPhase::Idle;
            state.session = None;
            state.incoming_number.clear();
            state.customer = None;
            state.epoch += 1;
            (state.pipelines.take(), changed)
        };

        if let Some(pipelines) = pipelines {
            tracing::info!("Hanging up session {}", pipelines.uplink.session_id());
            pipelines.shutdown();
        }
        if changed {
            self.emit(CallEvent::PhaseChanged(CallPhase::Idle));
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Öffnet Geräte und Uplink und wechselt in die aktive Phase,
    /// sofern der Anruf inzwischen nicht beendet wurde
    async fn activate(
        &self,
        epoch: u64,
        from: CallPhase,
        session_id: String,
        role: CallRole,
        phone_number: Option<String>,
    ) -> Result<String, CallEngineError> {
        if self.state.lock().epoch != epoch {
            tracing::info!("Session {} abandoned, call ended meanwhile", session_id);
            return Err(CallEngineError::Cancelled);
        }

        let pipelines = self
            .open_pipelines(&session_id)
            .await
            .map_err(|e| self.fail(e))?;

        let phase = match role {
            CallRole::Initiator => CallPhase::Active,
            CallRole::Joiner => CallPhase::ActiveCustomer,
        };

        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.phase != from {
                drop(state);
                pipelines.shutdown();
                tracing::info!("Session {} abandoned, call ended meanwhile", session_id);
                return Err(CallEngineError::Cancelled);
            }
            let customer = state.customer.clone();
            state.session = Some(CallSession {
                session_id: session_id.clone(),
                role,
                remote: RemoteParty {
                    phone_number,
                    customer,
                },
                started_at: Utc::now(),
            });
            state.pipelines = Some(pipelines);
            state.phase = phase;
        }

        tracing::info!("Call is active in session {} ({})", session_id, phase);
        self.emit(CallEvent::PhaseChanged(phase));
        Ok(session_id)
    }

    /// Mikrofon, Ausgabe und Uplink öffnen. Scheitert ein Schritt, werden
    /// die bereits belegten Geräte beim Drop freigegeben.
    async fn open_pipelines(&self, session_id: &str) -> Result<ActivePipelines, CallEngineError> {
        let (mut capture, sink) = self.open_devices().await?;
        let uplink = Arc::new(self.relay.open_uplink(session_id).await?);

        let blocks = capture.take_blocks().ok_or_else(|| {
            AudioError::StreamBuildError("capture stream already consumed".to_string())
        })?;
        let pump = tokio::spawn(uplink_pump(blocks, Arc::clone(&uplink)));

        Ok(ActivePipelines {
            capture,
            sink,
            uplink,
            pump,
        })
    }

    /// Geräte auf einem Blocking-Thread öffnen; das Backend darf beim
    /// Öffnen blockieren
    async fn open_devices(&self) -> Result<(CaptureStream, AudioSink), AudioError> {
        let audio = Arc::clone(&self.audio);
        let block_size = self.block_size;

        tokio::task::spawn_blocking(move || -> Result<(CaptureStream, AudioSink), AudioError> {
            let capture = audio.open_capture(block_size)?;
            let sink = audio.open_sink()?;
            Ok((capture, sink))
        })
        .await
        .map_err(|e| AudioError::StreamBuildError(format!("device task failed: {}", e)))?
    }

    /// Fehler merken, melden und zurückgeben
    fn fail(&self, err: CallEngineError) -> CallEngineError {
        tracing::error!("Call transition failed: {}", err);
        self.state.lock().last_error = Some(err.to_string());
        self.emit(CallEvent::Error(err.to_string()));
        err
    }

    /// Sendet ein Event an alle Beobachter
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        let pipelines = self.state.lock().pipelines.take();
        if let Some(pipelines) = pipelines {
            pipelines.shutdown();
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallEngine")
            .field("phase", &state.phase)
            .field("incoming_number", &state.incoming_number)
            .field("session", &state.session)
            .finish()
    }
}
