//! Gemeinsame Fakes für die Integrationstests
//!
//! - `FakeRelay`: In-Memory Connector, der Test spielt das Relay
//! - `RelayScript`: beantwortet Aufrufe und protokolliert alles Ausgehende
//! - `FakeAudio`: zählt geöffnete und freigegebene Geräte

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_voice::call_engine::{
    AudioBackend, AudioError, AudioSink, CallEngine, CaptureStream, DeviceHandle, PlaybackOutput,
};
use relay_voice::config::ClientConfig;
use relay_voice::lookup::{Customer, CustomerDirectory, LookupError};
use relay_voice::signaling::{
    ClientMessage, Connector, Invocation, RelayLink, ServerMessage, SignalingError,
};
use relay_voice::VoiceClient;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const LOCAL_PEER: &str = "peer-local";
pub const REMOTE_PEER: &str = "peer-remote";
pub const SESSION_ID: &str = "abc123";
pub const MISSING_SESSION: &str = "no-such-session";
pub const KNOWN_CALLER: &str = "+15551234567";

/// Wartet bis `cond` gilt (höchstens 2 s)
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// RELAY
// ============================================================================

/// Relay-Seite einer aufgebauten Verbindung
pub struct RelaySide {
    pub to_client: mpsc::Sender<ServerMessage>,
    pub from_client: mpsc::Receiver<ClientMessage>,
}

pub struct FakeRelay {
    failures: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
    links: mpsc::UnboundedSender<RelaySide>,
}

impl FakeRelay {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RelaySide>) {
        let (links, sides) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            failures: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
            links,
        });
        (relay, sides)
    }

    /// Die nächsten `n` Verbindungsversuche scheitern
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Zeitpunkte aller bisherigen Versuche
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeRelay {
    async fn connect(&self) -> Result<RelayLink, SignalingError> {
        self.attempts.lock().push(Instant::now());

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SignalingError::ConnectionFailed(
                "relay unreachable".to_string(),
            ));
        }

        let (outbound, from_client) = mpsc::channel(64);
        let (to_client, inbound) = mpsc::channel(64);
        let _ = self.links.send(RelaySide {
            to_client,
            from_client,
        });

        Ok(RelayLink {
            peer_id: LOCAL_PEER.to_string(),
            outbound,
            inbound,
        })
    }
}

/// Spielt das Relay auf einer Verbindung
///
/// Antworten auf Aufrufe kosten je ein Permit aus `gate`; ein gesperrtes
/// Script lässt Aufrufe hängen, bis der Test sie freigibt.
pub struct RelayScript {
    to_client: Option<mpsc::Sender<ServerMessage>>,
    log: Arc<Mutex<Vec<ClientMessage>>>,
    gate: Arc<Semaphore>,
    task: JoinHandle<()>,
}

impl RelayScript {
    pub fn spawn(side: RelaySide) -> Self {
        Self::with_gate(side, Semaphore::MAX_PERMITS)
    }

    pub fn spawn_gated(side: RelaySide) -> Self {
        Self::with_gate(side, 0)
    }

    fn with_gate(side: RelaySide, permits: usize) -> Self {
        let RelaySide {
            to_client,
            mut from_client,
        } = side;
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(permits));

        let task = {
            let log = Arc::clone(&log);
            let gate = Arc::clone(&gate);
            let to_client = to_client.clone();
            tokio::spawn(async move {
                while let Some(msg) = from_client.recv().await {
                    log.lock().push(msg.clone());

                    let ClientMessage::Invoke {
                        invocation_id: Some(invocation_id),
                        invocation,
                    } = msg
                    else {
                        continue;
                    };
                    let Ok(permit) = gate.acquire().await else {
                        break;
                    };
                    permit.forget();

                    let reply = match invocation {
                        Invocation::StartCallSession => ServerMessage::Completion {
                            invocation_id,
                            result: Some(SESSION_ID.to_string()),
                            error: None,
                        },
                        Invocation::JoinCallSession { session_id }
                            if session_id == MISSING_SESSION =>
                        {
                            ServerMessage::Completion {
                                invocation_id,
                                result: None,
                                error: Some("Session not found".to_string()),
                            }
                        }
                        Invocation::JoinCallSession { .. } => ServerMessage::Completion {
                            invocation_id,
                            result: None,
                            error: None,
                        },
                    };
                    if to_client.send(reply).await.is_err() {
                        break;
                    }
                }
            })
        };

        Self {
            to_client: Some(to_client),
            log,
            gate,
            task,
        }
    }

    /// Gibt `n` zurückgehaltene Antworten frei
    pub fn release_replies(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Push-Nachricht an den Client
    pub async fn push(&self, msg: ServerMessage) {
        if let Some(tx) = &self.to_client {
            tx.send(msg).await.expect("client went away");
        }
    }

    pub fn log(&self) -> Vec<ClientMessage> {
        self.log.lock().clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log()
            .into_iter()
            .filter_map(|msg| match msg {
                ClientMessage::Invoke { invocation, .. } => Some(invocation),
                _ => None,
            })
            .collect()
    }

    /// Relay-seitiger Verbindungsabbruch
    pub fn disconnect(&mut self) {
        self.task.abort();
        self.to_client = None;
    }
}

impl Drop for RelayScript {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// AUDIO
// ============================================================================

#[derive(Default)]
pub struct DeviceCounters {
    pub captures_opened: AtomicUsize,
    pub captures_released: AtomicUsize,
    pub sinks_opened: AtomicUsize,
    pub sinks_released: AtomicUsize,
}

struct FakeMic {
    counters: Arc<DeviceCounters>,
}

impl DeviceHandle for FakeMic {
    fn release(&mut self) {
        self.counters.captures_released.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSpeaker {
    counters: Arc<DeviceCounters>,
    played: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl PlaybackOutput for FakeSpeaker {
    fn schedule(&mut self, block: &[f32]) {
        self.played.lock().push(block.to_vec());
    }

    fn release(&mut self) {
        self.counters.sinks_released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeAudio {
    counters: Arc<DeviceCounters>,
    mic: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    played: Arc<Mutex<Vec<Vec<f32>>>>,
    fail_capture: Mutex<Option<AudioError>>,
    fail_sink: Mutex<Option<AudioError>>,
    open_delay: Mutex<Option<Duration>>,
}

impl FakeAudio {
    pub fn fail_capture(&self, err: AudioError) {
        *self.fail_capture.lock() = Some(err);
    }

    pub fn fail_sink(&self, err: AudioError) {
        *self.fail_sink.lock() = Some(err);
    }

    /// Mikrofon-Öffnen blockiert den Thread so lange wie ein echtes Gerät
    pub fn slow_open(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    /// (geöffnet, freigegeben) für Mikrofon und Ausgabe
    pub fn capture_counts(&self) -> (usize, usize) {
        (
            self.counters.captures_opened.load(Ordering::SeqCst),
            self.counters.captures_released.load(Ordering::SeqCst),
        )
    }

    pub fn sink_counts(&self) -> (usize, usize) {
        (
            self.counters.sinks_opened.load(Ordering::SeqCst),
            self.counters.sinks_released.load(Ordering::SeqCst),
        )
    }

    /// Liefert einen Block, als käme er vom Mikrofon
    pub async fn speak(&self, block: Vec<f32>) {
        let tx = self.mic.lock().clone().expect("capture not open");
        tx.send(block).await.expect("capture closed");
    }

    pub fn played(&self) -> Vec<Vec<f32>> {
        self.played.lock().clone()
    }
}

impl AudioBackend for FakeAudio {
    fn open_capture(&self, _block_size: usize) -> Result<CaptureStream, AudioError> {
        if let Some(delay) = *self.open_delay.lock() {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.fail_capture.lock().clone() {
            return Err(err);
        }
        self.counters.captures_opened.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        *self.mic.lock() = Some(tx);
        Ok(CaptureStream::new(
            rx,
            Box::new(FakeMic {
                counters: Arc::clone(&self.counters),
            }),
        ))
    }

    fn open_sink(&self) -> Result<AudioSink, AudioError> {
        if let Some(err) = self.fail_sink.lock().clone() {
            return Err(err);
        }
        self.counters.sinks_opened.fetch_add(1, Ordering::SeqCst);

        Ok(AudioSink::new(Box::new(FakeSpeaker {
            counters: Arc::clone(&self.counters),
            played: Arc::clone(&self.played),
        })))
    }
}

// ============================================================================
// DIRECTORY
// ============================================================================

pub struct StaticDirectory;

#[async_trait]
impl CustomerDirectory for StaticDirectory {
    async fn lookup(&self, phone_number: &str) -> Result<Customer, LookupError> {
        if phone_number == KNOWN_CALLER {
            Ok(Customer {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                phone_number: phone_number.to_string(),
                address: Some("12 St James's Square, London".to_string()),
            })
        } else {
            Err(LookupError::UnknownCaller)
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Verbundener VoiceClient mit Fake-Relay und Fake-Audio
pub struct Harness {
    pub client: VoiceClient,
    pub relay: Arc<FakeRelay>,
    pub audio: Arc<FakeAudio>,
    pub script: RelayScript,
    pub sides: mpsc::UnboundedReceiver<RelaySide>,
}

impl Harness {
    pub async fn connected() -> Self {
        Self::connect_with(RelayScript::spawn).await
    }

    /// Wie `connected`, aber Antworten auf Aufrufe bleiben hängen
    pub async fn connected_gated() -> Self {
        Self::connect_with(RelayScript::spawn_gated).await
    }

    async fn connect_with(spawn: fn(RelaySide) -> RelayScript) -> Self {
        let (relay, mut sides) = FakeRelay::new();
        let audio = Arc::new(FakeAudio::default());
        let client = VoiceClient::new(
            &ClientConfig::default(),
            relay.clone(),
            audio.clone(),
            Arc::new(StaticDirectory),
        );
        client.start();

        let side = tokio::time::timeout(Duration::from_secs(2), sides.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        let script = spawn(side);
        eventually(|| client.relay().is_connected()).await;

        Self {
            client,
            relay,
            audio,
            script,
            sides,
        }
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        self.client.engine()
    }

    /// Eingehender Anruf bis `Ringing`
    pub async fn ring(&self, phone_number: &str) {
        self.script
            .push(ServerMessage::IncomingCall {
                phone_number: phone_number.to_string(),
            })
            .await;
        let engine = self.engine();
        eventually(|| engine.phase() == relay_voice::call_engine::CallPhase::Ringing).await;
    }
}
