//! Best-effort discovery of the machine's public address.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::schema::ExternalIpSettings;

/// Error type for external-IP lookups.
#[derive(Debug, Error)]
pub enum ExternalIpError {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {0:?}, not an IP address")]
    Parse(String),
}

/// Something that can find out what the Internet sees as our address.
#[async_trait]
pub trait ExternalIpProvider: Send + Sync {
    async fn lookup(&self) -> Result<IpAddr, ExternalIpError>;
}

/// Queries a plain-text IP-echo endpoint.
pub struct HttpExternalIp {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExternalIp {
    pub fn new(settings: &ExternalIpSettings) -> Result<Self, ExternalIpError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ExternalIpProvider for HttpExternalIp {
    async fn lookup(&self) -> Result<IpAddr, ExternalIpError> {
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let trimmed = body.trim();
        trimmed
            .parse()
            .map_err(|_| ExternalIpError::Parse(trimmed.to_string()))
    }
}

/// Caches the last known external address and announces updates.
pub struct ExternalIpService {
    provider: Arc<dyn ExternalIpProvider>,
    current: Mutex<Option<IpAddr>>,
    updated: broadcast::Sender<IpAddr>,
}

impl ExternalIpService {
    pub fn new(provider: Arc<dyn ExternalIpProvider>) -> Self {
        let (updated, _) = broadcast::channel(16);
        Self {
            provider,
            current: Mutex::new(None),
            updated,
        }
    }

    /// The last successfully looked-up address, if any.
    pub fn current(&self) -> Option<IpAddr> {
        *self.current.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IpAddr> {
        self.updated.subscribe()
    }

    /// Run one lookup, remember and announce the result.
    pub async fn refresh(&self) -> Result<IpAddr, ExternalIpError> {
        let address = self.provider.lookup().await?;
        *self.current.lock().unwrap() = Some(address);
        let _ = self.updated.send(address);
        Ok(address)
    }
}
