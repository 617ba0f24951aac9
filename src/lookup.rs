//! Kunden-Lookup
//!
//! Externer HTTP-Dienst, der zu einer Rufnummer den Kundendatensatz liefert.
//! Ein Fehlschlag ist rein kosmetisch und hält keinen Anruf auf.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Unknown Caller")]
    UnknownCaller,

    #[error("Lookup request failed: {0}")]
    Network(String),

    #[error("Invalid lookup response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LookupError::Parse(err.to_string())
        } else {
            LookupError::Network(err.to_string())
        }
    }
}

/// Kundendatensatz
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone_number: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// Verzeichnis, das Rufnummern zu Kunden auflöst
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn lookup(&self, phone_number: &str) -> Result<Customer, LookupError>;
}

/// Verzeichnis ohne Einträge (wenn kein Lookup konfiguriert ist)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectory;

#[async_trait]
impl CustomerDirectory for NoDirectory {
    async fn lookup(&self, _phone_number: &str) -> Result<Customer, LookupError> {
        Err(LookupError::UnknownCaller)
    }
}

/// `GET {base}/customers/lookup?phoneNumber=...`
#[derive(Debug, Clone)]
pub struct HttpCustomerDirectory {
    base_url: String,
    client: Client,
}

impl HttpCustomerDirectory {
    pub fn new(base_url: &str) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LookupError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn lookup_url(&self) -> String {
        format!("{}/customers/lookup", self.base_url)
    }
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn lookup(&self, phone_number: &str) -> Result<Customer, LookupError> {
        tracing::debug!("Looking up customer for {}", phone_number);

        let response = self
            .client
            .get(self.lookup_url())
            .query(&[("phoneNumber", phone_number)])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Customer>().await?),
            StatusCode::NOT_FOUND => Err(LookupError::UnknownCaller),
            status => Err(LookupError::Network(format!("HTTP {}", status))),
        }
    }
}
