//! HTTP client for the relay surface.
//!
//! Thin typed wrapper over one shared `reqwest::Client`. Error mapping
//! follows the retry classes: connection failures and timeouts become
//! [`MailError::Transport`] (retryable), non-success statuses become
//! [`MailError::Relay`] (retryable only for 5xx).

use std::time::Duration;

use reqwest::StatusCode;

use crate::envelope::MessageEnvelope;
use crate::error::{MailError, MailResult};
use crate::relay::{PickupResponse, RegisterRequest, RegistryEntry, RelayStats};

/// Client handle for one relay.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    /// Build a client for the given base URL with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> MailResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("agentmail/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The relay base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /v0/register`: upsert this node in the name registry.
    pub async fn register(&self, req: &RegisterRequest) -> MailResult<()> {
        let url = format!("{}/v0/register", self.base_url);
        let response = self.http.post(url).json(req).send().await.map_err(transport)?;
        expect_success(response.status())?;
        Ok(())
    }

    /// `GET /v0/lookup/{name}`: `Ok(None)` on 404.
    pub async fn lookup(&self, name: &str) -> MailResult<Option<RegistryEntry>> {
        let url = format!("{}/v0/lookup/{}", self.base_url, name);
        let response = self.http.get(url).send().await.map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_success(response.status())?;
        let entry = response
            .json::<RegistryEntry>()
            .await
            .map_err(|e| MailError::Serialization(format!("lookup response: {}", e)))?;
        Ok(Some(entry))
    }

    /// `POST /v0/deposit`: hand an envelope to the relay for later pickup.
    pub async fn deposit(&self, envelope: &MessageEnvelope) -> MailResult<()> {
        let url = format!("{}/v0/deposit", self.base_url);
        let response = self
            .http
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(transport)?;
        expect_success(response.status())?;
        Ok(())
    }

    /// `GET /v0/pickup/{fp}`: drain and return this node's queue.
    ///
    /// Envelopes that fail to parse are logged and skipped; one malformed
    /// deposit must not wedge the pickup loop.
    pub async fn pickup(&self, fp: &str) -> MailResult<Vec<MessageEnvelope>> {
        let url = format!("{}/v0/pickup/{}", self.base_url, fp);
        let response = self.http.get(url).send().await.map_err(transport)?;
        expect_success(response.status())?;
        let body = response
            .json::<PickupResponse>()
            .await
            .map_err(|e| MailError::Serialization(format!("pickup response: {}", e)))?;

        let mut envelopes = Vec::with_capacity(body.envelopes.len());
        for value in body.envelopes {
            match serde_json::from_value::<MessageEnvelope>(value) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed envelope from relay"),
            }
        }
        Ok(envelopes)
    }

    /// `GET /v0/stats`.
    pub async fn stats(&self) -> MailResult<RelayStats> {
        let url = format!("{}/v0/stats", self.base_url);
        let response = self.http.get(url).send().await.map_err(transport)?;
        expect_success(response.status())?;
        response
            .json::<RelayStats>()
            .await
            .map_err(|e| MailError::Serialization(format!("stats response: {}", e)))
    }
}

fn transport(e: reqwest::Error) -> MailError {
    MailError::Transport(format!("relay: {}", e))
}

fn expect_success(status: StatusCode) -> MailResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(MailError::Relay {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
        })
    }
}
