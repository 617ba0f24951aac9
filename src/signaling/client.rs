//! Relay Client - Streaming Transport
//!
//! Verwaltet die Kommunikation mit dem Relay über eine persistente Verbindung:
//! - Request/Response und Fire-and-Forget Aufrufe (Session-Control)
//! - Uplink-Streams (Audio zum Relay)
//! - Downlink-Audio und Anruf-Benachrichtigungen als Event-Channel
//! - Self-Echo Unterdrückung

use super::connection::{ConnectionState, Connector};
use super::messages::*;
use super::resilience::{ConnectionSupervisor, RetryPolicy};
use crate::call_engine::codec;
use crate::config::ClientConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Relay error: {0}")]
    ServerError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Push-Nachrichten vom Relay, in Empfangsreihenfolge
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Eingehender Anruf
    IncomingCall { phone_number: String },

    /// Downlink-Audio eines anderen Teilnehmers (eigene Frames sind bereits gefiltert)
    AudioChunk { samples: Vec<i16>, sender_id: String },
}

/// Self-Echo Regel: Frames mit der eigenen Peer-ID gehen nie an die Wiedergabe
pub fn is_self_echo(local_peer_id: Option<&str>, sender_id: &str) -> bool {
    local_peer_id == Some(sender_id)
}

// ============================================================================
// SHARED STATE
// ============================================================================

type PendingReply = oneshot::Sender<Result<Option<String>, SignalingError>>;

#[derive(Debug)]
struct LinkHandle {
    peer_id: String,
    outbound: mpsc::Sender<ClientMessage>,
    generation: u64,
}

/// Zustand, den Client, Supervisor und Uplinks teilen.
/// Nur der Supervisor schreibt `state` und `link`.
#[derive(Debug)]
pub(crate) struct RelayShared {
    state: RwLock<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    link: RwLock<Option<LinkHandle>>,
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_invocation: AtomicU64,
    event_tx: mpsc::Sender<RelayEvent>,
    dropped_chunks: AtomicU64,
}

impl RelayShared {
    fn new(event_tx: mpsc::Sender<RelayEvent>) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            state_tx,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            next_invocation: AtomicU64::new(1),
            event_tx,
            dropped_chunks: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Setzt den Zustand und benachrichtigt Beobachter, aber nur bei echtem Wechsel
    pub(crate) fn set_state(&self, new_state: ConnectionState) -> bool {
        let old_state = {
            let mut state = self.state.write();
            if *state == new_state {
                return false;
            }
            std::mem::replace(&mut *state, new_state)
        };
        tracing::info!("Relay connection: {} -> {}", old_state, new_state);
        let _ = self.state_tx.send(new_state);
        true
    }

    pub(crate) fn attach(&self, peer_id: String, outbound: mpsc::Sender<ClientMessage>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.link.write() = Some(LinkHandle {
            peer_id,
            outbound,
            generation,
        });
    }

    /// Trennt den Link und lässt alle offenen Aufrufe mit `NotConnected` scheitern
    pub(crate) fn detach(&self) {
        self.link.write().take();
        let pending: Vec<PendingReply> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            tracing::debug!("Failing {} pending invocations", pending.len());
        }
        for tx in pending {
            let _ = tx.send(Err(SignalingError::NotConnected));
        }
    }

    fn peer_id(&self) -> Option<String> {
        self.link.read().as_ref().map(|l| l.peer_id.clone())
    }

    /// Sender des aktuellen Links, nur wenn `Connected`
    fn outbound(&self) -> Result<(mpsc::Sender<ClientMessage>, u64), SignalingError> {
        if self.state() != ConnectionState::Connected {
            return Err(SignalingError::NotConnected);
        }
        self.link
            .read()
            .as_ref()
            .map(|l| (l.outbound.clone(), l.generation))
            .ok_or(SignalingError::NotConnected)
    }

    /// Sender und aktuelle Peer-ID, nur wenn der Link noch derselbe ist wie
    /// beim Öffnen
    fn outbound_for(&self, generation: u64) -> Option<(mpsc::Sender<ClientMessage>, String)> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.link
            .read()
            .as_ref()
            .filter(|l| l.generation == generation)
            .map(|l| (l.outbound.clone(), l.peer_id.clone()))
    }

    /// Verarbeitet eine eingehende Relay-Nachricht
    pub(crate) async fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { peer_id } => {
                tracing::debug!("Relay re-announced peer id {}", peer_id);
                if let Some(link) = self.link.write().as_mut() {
                    link.peer_id = peer_id;
                }
            }

            ServerMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let Some(tx) = self.pending.lock().remove(&invocation_id) else {
                    tracing::debug!("Completion for unknown invocation {}", invocation_id);
                    return;
                };
                let reply = match error {
                    Some(message) => Err(SignalingError::ServerError(message)),
                    None => Ok(result),
                };
                let _ = tx.send(reply);
            }

            ServerMessage::IncomingCall { phone_number } => {
                tracing::info!("Incoming call from {}", phone_number);
                // Control-Events mit Backpressure
                if self
                    .event_tx
                    .send(RelayEvent::IncomingCall { phone_number })
                    .await
                    .is_err()
                {
                    tracing::debug!("No event consumer, dropping incoming call");
                }
            }

            ServerMessage::ReceiveAudioChunk { chunk, sender_id } => {
                let local = self.peer_id();
                if is_self_echo(local.as_deref(), &sender_id) {
                    tracing::trace!("Suppressing self-echoed chunk ({} bytes)", chunk.len());
                    return;
                }
                let samples = codec::from_wire_bytes(&chunk);
                // Audio nie den Connection-Pump blockieren lassen
                match self
                    .event_tx
                    .try_send(RelayEvent::AudioChunk { samples, sender_id })
                {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let dropped = self.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!("Event channel full, dropped audio chunk ({} total)", dropped);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::trace!("No event consumer, dropping audio chunk");
                    }
                }
            }

            ServerMessage::Ping => {
                // Keep-Alive - nichts zu tun
            }
        }
    }
}

// ============================================================================
// UPLINK
// ============================================================================

/// Ausgehender Audio-Stream einer Session (`BroadcastAudioStream`)
///
/// Reihenfolge der Frames bleibt erhalten. Best-Effort: nach einem
/// Verbindungsabbruch werden Frames verworfen, nicht gepuffert. Frames
/// tragen die Peer-ID, die das Relay zum Sendezeitpunkt vergeben hat.
#[derive(Debug)]
pub struct Uplink {
    shared: Arc<RelayShared>,
    stream_id: String,
    session_id: String,
    generation: u64,
    completed: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Uplink {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Sendet einen PCM16-Frame
    pub async fn send(&self, frame: &[i16]) -> Result<(), SignalingError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("uplink already completed".to_string()));
        }

        let Some((outbound, sender_id)) = self.shared.outbound_for(self.generation) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(SignalingError::NotConnected);
        };

        let msg = ClientMessage::StreamItem {
            stream_id: self.stream_id.clone(),
            sender_id,
            chunk: codec::to_wire_bytes(frame),
        };

        if outbound.send(msg).await.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(SignalingError::NotConnected);
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Schließt den Stream sauber ab und wartet dafür auf Platz im
    /// Outbound-Channel. Weitere Aufrufe tun nichts.
    pub async fn finish(&self) {
        let Some(outbound) = self.begin_complete() else {
            return;
        };
        match outbound.send(self.complete_message()).await {
            Ok(()) => self.log_completed(),
            Err(_) => tracing::debug!("Uplink {} completed after connection closed", self.stream_id),
        }
    }

    /// Wie `finish`, aber ohne zu warten. Ist der Outbound-Channel voll,
    /// wird der Abschluss im Hintergrund zugestellt (sofern eine Runtime läuft).
    pub fn complete(&self) {
        let Some(outbound) = self.begin_complete() else {
            return;
        };
        match outbound.try_send(self.complete_message()) {
            Ok(()) => self.log_completed(),
            Err(mpsc::error::TrySendError::Full(msg)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let stream_id = self.stream_id.clone();
                    runtime.spawn(async move {
                        if outbound.send(msg).await.is_err() {
                            tracing::debug!("Uplink {} completed after connection closed", stream_id);
                        }
                    });
                }
                Err(_) => tracing::warn!(
                    "Outbound queue full and no runtime, uplink {} not completed cleanly",
                    self.stream_id
                ),
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Uplink {} completed after connection closed", self.stream_id)
            }
        }
    }

    /// Markiert den Stream als abgeschlossen; Sender nur beim ersten Aufruf
    /// und solange die Verbindung noch dieselbe ist
    fn begin_complete(&self) -> Option<mpsc::Sender<ClientMessage>> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return None;
        }
        match self.shared.outbound_for(self.generation) {
            Some((outbound, _)) => Some(outbound),
            None => {
                tracing::debug!("Uplink {} completed without live connection", self.stream_id);
                None
            }
        }
    }

    fn complete_message(&self) -> ClientMessage {
        ClientMessage::StreamComplete {
            stream_id: self.stream_id.clone(),
        }
    }

    fn log_completed(&self) {
        tracing::info!(
            "Uplink {} completed after {} frames ({} dropped)",
            self.stream_id,
            self.sent(),
            self.dropped()
        );
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Noch auf derselben Verbindung wie beim Öffnen?
    pub fn is_live(&self) -> bool {
        !self.is_completed() && self.shared.outbound_for(self.generation).is_some()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Uplink {
    fn drop(&mut self) {
        self.complete();
    }
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// Client für das Relay
///
/// Besitzt die Verbindung (über den Supervisor), die offenen Aufrufe und
/// den Event-Channel.
pub struct RelayClient {
    shared: Arc<RelayShared>,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    invoke_timeout: Duration,
    events: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RelayClient {
    /// Erstellt einen neuen RelayClient (noch ohne Verbindung)
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        Self {
            shared: Arc::new(RelayShared::new(event_tx)),
            connector,
            policy: RetryPolicy::from_config(config),
            invoke_timeout: config.invoke_timeout(),
            events: Mutex::new(Some(event_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Gibt einen Receiver für Zustandswechsel zurück
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Gibt den Event-Channel heraus (nur beim ersten Aufruf)
    pub fn take_events(&self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.events.lock().take()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Vom Relay vergebene Peer-ID der aktuellen Verbindung
    pub fn peer_id(&self) -> Option<String> {
        self.shared.peer_id()
    }

    /// Audio-Chunks, die wegen vollem Event-Channel verworfen wurden
    pub fn dropped_chunks(&self) -> u64 {
        self.shared.dropped_chunks.load(Ordering::Relaxed)
    }

    /// Startet den Verbindungsaufbau, falls `Disconnected` und kein Supervisor läuft
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock();
        if let Some((_, handle)) = supervisor.as_ref() {
            if !handle.is_finished() {
                tracing::debug!("Relay supervisor already running");
                return;
            }
        }
        if self.state() != ConnectionState::Disconnected {
            return;
        }

        let cancel = CancellationToken::new();
        let task = ConnectionSupervisor::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.policy,
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());
        *supervisor = Some((cancel, handle));
    }

    /// Beendet die Verbindung und alle Wiederholungsversuche
    pub async fn stop(&self) {
        let running = self.supervisor.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("Relay supervisor task failed: {}", e);
            }
        }
    }

    /// Request/Response Aufruf. Wartet auf das Relay oder den Timeout.
    pub async fn invoke(&self, invocation: Invocation) -> Result<Option<String>, SignalingError> {
        let (outbound, _) = self.shared.outbound()?;

        let invocation_id = self.shared.next_invocation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(invocation_id, tx);

        tracing::debug!("Invoking {} (#{})", invocation.method(), invocation_id);

        let msg = ClientMessage::Invoke {
            invocation_id: Some(invocation_id),
            invocation,
        };
        if outbound.send(msg).await.is_err() {
            self.shared.pending.lock().remove(&invocation_id);
            return Err(SignalingError::NotConnected);
        }

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender weg -> Link wurde getrennt
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().remove(&invocation_id);
                Err(SignalingError::Timeout(format!("invocation #{}", invocation_id)))
            }
        }
    }

    /// Fire-and-Forget Aufruf
    pub async fn send(&self, invocation: Invocation) -> Result<(), SignalingError> {
        let (outbound, _) = self.shared.outbound()?;
        let msg = ClientMessage::Invoke {
            invocation_id: None,
            invocation,
        };
        outbound
            .send(msg)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Legt eine neue Session an und gibt deren ID zurück
    pub async fn start_call_session(&self) -> Result<String, SignalingError> {
        match self.invoke(Invocation::StartCallSession).await? {
            Some(session_id) if !session_id.is_empty() => Ok(session_id),
            _ => Err(SignalingError::Protocol(
                "StartCallSession returned no session id".to_string(),
            )),
        }
    }

    /// Tritt einer bestehenden Session bei
    pub async fn join_call_session(&self, session_id: &str) -> Result<(), SignalingError> {
        self.invoke(Invocation::JoinCallSession {
            session_id: session_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Öffnet den Uplink einer Session
    pub async fn open_uplink(&self, session_id: &str) -> Result<Uplink, SignalingError> {
        let (outbound, generation) = self.shared.outbound()?;
        let stream_id = uuid::Uuid::new_v4().to_string();

        outbound
            .send(ClientMessage::StreamInvocation {
                stream_id: stream_id.clone(),
                session_id: session_id.to_string(),
            })
            .await
            .map_err(|_| SignalingError::NotConnected)?;

        tracing::info!("Uplink {} opened for session {}", stream_id, session_id);

        Ok(Uplink {
            shared: Arc::clone(&self.shared),
            stream_id,
            session_id: session_id.to_string(),
            generation,
            completed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.supervisor.lock().take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("state", &self.state())
            .field("peer_id", &self.peer_id())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<RelayShared>, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (Arc::new(RelayShared::new(tx)), rx)
    }

    fn connect(shared: &RelayShared, peer_id: &str) -> mpsc::Receiver<ClientMessage> {
        connect_with_capacity(shared, peer_id, 16)
    }

    fn connect_with_capacity(
        shared: &RelayShared,
        peer_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<ClientMessage> {
        let (tx, rx) = mpsc::channel(capacity);
        shared.attach(peer_id.to_string(), tx);
        shared.set_state(ConnectionState::Connected);
        rx
    }

    /// Uplink auf dem aktuellen Link
    fn uplink(shared: &Arc<RelayShared>) -> Uplink {
        Uplink {
            shared: Arc::clone(shared),
            stream_id: "s".to_string(),
            session_id: "abc".to_string(),
            generation: shared.generation.load(Ordering::SeqCst),
            completed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_self_echo_rule() {
        assert!(is_self_echo(Some("me"), "me"));
        assert!(!is_self_echo(Some("me"), "you"));
        assert!(!is_self_echo(None, "me"));
    }

    #[tokio::test]
    async fn test_own_chunks_never_reach_events() {
        let (shared, mut events) = shared();
        let _out = connect(&shared, "me");

        for chunk in [vec![], vec![1, 0], vec![0xFF; 256]] {
            shared
                .dispatch(ServerMessage::ReceiveAudioChunk {
                    chunk,
                    sender_id: "me".to_string(),
                })
                .await;
        }
        shared
            .dispatch(ServerMessage::ReceiveAudioChunk {
                chunk: vec![2, 0, 3, 0],
                sender_id: "you".to_string(),
            })
            .await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            RelayEvent::AudioChunk {
                samples: vec![2, 3],
                sender_id: "you".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_drops_audio_not_calls() {
        let (shared, mut events) = shared();
        let _out = connect(&shared, "me");

        for _ in 0..6 {
            shared
                .dispatch(ServerMessage::ReceiveAudioChunk {
                    chunk: vec![0, 0],
                    sender_id: "you".to_string(),
                })
                .await;
        }
        assert_eq!(shared.dropped_chunks.load(Ordering::Relaxed), 2);

        // IncomingCall wartet auf Platz statt verworfen zu werden
        let dispatcher = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared
                    .dispatch(ServerMessage::IncomingCall {
                        phone_number: "+15551234567".to_string(),
                    })
                    .await;
            })
        };
        for _ in 0..4 {
            assert!(matches!(events.recv().await, Some(RelayEvent::AudioChunk { .. })));
        }
        dispatcher.await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(RelayEvent::IncomingCall {
                phone_number: "+15551234567".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_detach_fails_pending_invocations() {
        let (shared, _events) = shared();
        let _out = connect(&shared, "me");

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(42, tx);
        shared.detach();

        assert_eq!(rx.await.unwrap(), Err(SignalingError::NotConnected));
        assert!(shared.peer_id().is_none());
    }

    #[tokio::test]
    async fn test_completion_routes_to_pending() {
        let (shared, _events) = shared();
        let _out = connect(&shared, "me");

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(3, tx);
        shared
            .dispatch(ServerMessage::Completion {
                invocation_id: 3,
                result: None,
                error: Some("no such session".to_string()),
            })
            .await;

        assert_eq!(
            rx.await.unwrap(),
            Err(SignalingError::ServerError("no such session".to_string()))
        );
    }

    #[test]
    fn test_set_state_only_notifies_on_change() {
        let (shared, _events) = shared();
        let mut rx = shared.state_tx.subscribe();

        assert!(!shared.set_state(ConnectionState::Disconnected));
        assert!(shared.set_state(ConnectionState::Connecting));
        assert!(!shared.set_state(ConnectionState::Connecting));

        assert_eq!(rx.try_recv().unwrap(), ConnectionState::Connecting);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_uplink_dead_after_reconnect() {
        let (shared, _events) = shared();
        let mut out = connect(&shared, "me");

        let uplink = Uplink {
            shared: Arc::clone(&shared),
            stream_id: "s".to_string(),
            session_id: "abc".to_string(),
            generation: 1,
            completed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        uplink.send(&[1, 2]).await.unwrap();
        assert!(matches!(out.recv().await, Some(ClientMessage::StreamItem { .. })));

        // Neue Verbindung -> alter Stream ist beim Relay unbekannt
        shared.detach();
        let _out2 = connect(&shared, "me-again");
        assert!(!uplink.is_live());
        assert_eq!(uplink.send(&[3]).await, Err(SignalingError::NotConnected));
        assert_eq!(uplink.sent(), 1);
        assert_eq!(uplink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_complete_on_full_queue_still_arrives_after_frames() {
        let (shared, _events) = shared();
        let mut out = connect_with_capacity(&shared, "me", 2);
        let uplink = uplink(&shared);

        uplink.send(&[1]).await.unwrap();
        uplink.send(&[2]).await.unwrap();
        uplink.complete();
        uplink.complete();
        assert!(uplink.is_completed());
        assert!(uplink.send(&[3]).await.is_err());

        assert!(matches!(out.recv().await, Some(ClientMessage::StreamItem { .. })));
        assert!(matches!(out.recv().await, Some(ClientMessage::StreamItem { .. })));
        assert_eq!(
            out.recv().await,
            Some(ClientMessage::StreamComplete {
                stream_id: "s".to_string()
            })
        );
        tokio::task::yield_now().await;
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finish_waits_for_room() {
        let (shared, _events) = shared();
        let mut out = connect_with_capacity(&shared, "me", 1);
        let uplink = Arc::new(uplink(&shared));
        uplink.send(&[1]).await.unwrap();

        let finishing = {
            let uplink = Arc::clone(&uplink);
            tokio::spawn(async move { uplink.finish().await })
        };
        assert!(matches!(out.recv().await, Some(ClientMessage::StreamItem { .. })));
        assert!(matches!(out.recv().await, Some(ClientMessage::StreamComplete { .. })));
        finishing.await.unwrap();
        assert!(uplink.is_completed());
    }

    #[tokio::test]
    async fn test_uplink_follows_reannounced_peer_id() {
        let (shared, mut events) = shared();
        let mut out = connect(&shared, "me");
        let uplink = uplink(&shared);

        shared
            .dispatch(ServerMessage::Welcome {
                peer_id: "me-renamed".to_string(),
            })
            .await;
        uplink.send(&[7]).await.unwrap();
        match out.recv().await {
            Some(ClientMessage::StreamItem { sender_id, .. }) => assert_eq!(sender_id, "me-renamed"),
            other => panic!("unexpected message {:?}", other),
        }

        // Echo unter der neuen ID wird unterdrückt
        shared
            .dispatch(ServerMessage::ReceiveAudioChunk {
                chunk: vec![7, 0],
                sender_id: "me-renamed".to_string(),
            })
            .await;
        assert!(events.try_recv().is_err());
    }
}
