//! Forwarding instances to the external platform
//!
//! A forwarder makes exactly one attempt per call. Retrying is the ingestion
//! worker's job, so every failure here is reported as retryable.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::debug;

use crate::config::ForwardSettings;
use crate::error::{Error, Result};
use crate::field::Instance;
use crate::registry::Source;

/// Header carrying the source's public key
pub const PUBLIC_KEY_HEADER: &str = "X-Public-Key";

/// Header carrying the source's secret key
pub const SECRET_KEY_HEADER: &str = "X-Secret-Key";

/// Sends a batch of a source's instances to the platform
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Deliver `instances` (possibly empty) on behalf of `source`
    async fn forward(&self, source: &Source, instances: &[Instance]) -> Result<()>;
}

/// JSON body of a forward call.
///
/// The JSON array of instances, each an array of field values, is wrapped
/// in an object under `instances`: `{ "instances": [[...], ...] }`.
pub fn forward_body(instances: &[Instance]) -> serde_json::Value {
    serde_json::json!({
        "instances": instances.iter().map(Instance::to_json).collect::<Vec<_>>()
    })
}

/// Forwards over HTTP with reqwest
pub struct HttpForwarder {
    client: reqwest::Client,
    url: String,
}

impl HttpForwarder {
    /// Create a forwarder posting to `url`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Create a forwarder from settings
    pub fn from_settings(settings: &ForwardSettings) -> Result<Self> {
        Self::new(
            settings.url.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, source: &Source, instances: &[Instance]) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(PUBLIC_KEY_HEADER, source.public_key())
            .header(SECRET_KEY_HEADER, source.secret_key().expose_secret())
            .json(&forward_body(instances))
            .send()
            .await
            .map_err(|e| Error::forward(format!("request failed: {}", e), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::forward(
                format!("platform responded {} {}", status, body.trim()),
                Some(status.as_u16()),
            ));
        }

        debug!(
            source = %source.public_key(),
            batch = instances.len(),
            status = status.as_u16(),
            "platform acknowledged batch"
        );
        Ok(())
    }
}
