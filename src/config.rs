//! Client-Konfiguration
//!
//! Alle Felder haben Defaults; `from_env` überschreibt einzelne Werte aus
//! Umgebungsvariablen.

use crate::call_engine::{BLOCK_SIZE, SAMPLE_RATE};
use crate::signaling::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RETRY_DELAY};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Default Relay URL (kann über `RELAY_URL` überschrieben werden)
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:5000/callHub";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay-Endpunkt; http(s) wird zu ws(s)
    pub relay_url: String,
    /// Basis-URL des Kunden-Lookups, ohne Lookup kein Kunden-Display
    pub lookup_base_url: Option<String>,
    pub retry_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub handshake_timeout_ms: u64,
    pub invoke_timeout_ms: u64,
    pub block_size: usize,
    pub sample_rate: u32,
    pub event_capacity: usize,
    pub uplink_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            lookup_base_url: None,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            handshake_timeout_ms: 10_000,
            invoke_timeout_ms: 30_000,
            block_size: BLOCK_SIZE,
            sample_rate: SAMPLE_RATE,
            event_capacity: 256,
            uplink_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Defaults plus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(url) = std::env::var("CUSTOMER_LOOKUP_URL") {
            config.lookup_base_url = Some(url);
        }
        if let Ok(value) = std::env::var("RELAY_RETRY_DELAY_MS") {
            config.retry_delay_ms = parse_var("RELAY_RETRY_DELAY_MS", &value)?;
        }
        if let Ok(value) = std::env::var("RELAY_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse_var("RELAY_MAX_RECONNECT_ATTEMPTS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ws_url()?;
        if let Some(base) = &self.lookup_base_url {
            url::Url::parse(base).map_err(|e| ConfigError::InvalidUrl {
                url: base.clone(),
                reason: e.to_string(),
            })?;
        }
        if self.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "block_size",
                value: "0".to_string(),
            });
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                name: "sample_rate",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// WebSocket URL des Relays
    pub fn ws_url(&self) -> Result<String, ConfigError> {
        let mut url = url::Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl {
                    url: self.relay_url.clone(),
                    reason: format!("unsupported scheme '{}'", other),
                })
            }
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
                url: self.relay_url.clone(),
                reason: "cannot rewrite scheme".to_string(),
            })?;
        }
        Ok(url.to_string())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}
