//! Connection Resilience
//!
//! Hält die Relay-Verbindung am Leben:
//! - `Disconnected -> Connecting -> Connected`
//! - Abbruch: `Connected -> Reconnecting`, erneuter Versuch sofort, danach
//!   im festen Abstand bis `max_reconnect_attempts`
//! - erschöpft: `Reconnecting -> Disconnected`, dann wieder von vorn
//!
//! Der Abstand zwischen Versuchen ist konstant (kein exponentielles Backoff).

use super::client::RelayShared;
use super::connection::{ConnectionState, Connector, RelayLink};
use crate::config::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Standard-Abstand zwischen Verbindungsversuchen
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Versuche im Zustand `Reconnecting`, bevor auf `Disconnected` zurückgefallen wird
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            delay: config.retry_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

/// Einziger Schreiber von `ConnectionState`
pub(crate) struct ConnectionSupervisor {
    shared: Arc<RelayShared>,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        shared: Arc<RelayShared>,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            connector,
            policy,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        // Some(n) solange wir nach einem Abbruch wiederverbinden
        let mut reconnect_failures: Option<u32> = None;

        loop {
            if reconnect_failures.is_none() {
                self.shared.set_state(ConnectionState::Connecting);
            }

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match attempt {
                Ok(link) => {
                    if !self.serve(link).await {
                        break;
                    }
                    self.shared.set_state(ConnectionState::Reconnecting);
                    reconnect_failures = Some(0);
                    continue;
                }
                Err(e) => {
                    match reconnect_failures.as_mut() {
                        Some(n) => {
                            *n += 1;
                            tracing::warn!(
                                "Reconnect attempt {}/{} failed: {}",
                                n,
                                self.policy.max_reconnect_attempts,
                                e
                            );
                            if *n >= self.policy.max_reconnect_attempts {
                                reconnect_failures = None;
                                self.shared.set_state(ConnectionState::Disconnected);
                            }
                        }
                        None => {
                            tracing::error!("Relay connection error: {}", e);
                            self.shared.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
            }

            tracing::debug!("Retrying relay connection in {:?}", self.policy.delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }

        self.shared.detach();
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!("Relay supervisor stopped");
    }

    /// Pumpt eingehende Nachrichten bis die Verbindung abbricht.
    /// `false` heißt: explizit gestoppt.
    async fn serve(&self, link: RelayLink) -> bool {
        let RelayLink {
            peer_id,
            outbound,
            mut inbound,
        } = link;

        self.shared.attach(peer_id, outbound);
        self.shared.set_state(ConnectionState::Connected);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shared.detach();
                    return false;
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.shared.dispatch(msg).await,
                    None => break,
                },
            }
        }

        tracing::warn!("Connection to relay lost");
        self.shared.detach();
        true
    }
}
