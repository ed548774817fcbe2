use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use exportdesk_agent::realtime::{RealtimeChannel, RealtimeError};
use exportdesk_core::config::RealtimeConfig;
use exportdesk_core::realtime::{sign_payload, RealtimeMessage, SIGNATURE_HEADER};

/// Posts each bus event as JSON to a configured webhook, signed with HMAC-SHA256 when a
/// signing secret is set.
pub struct WebhookRealtimeChannel {
    client: Client,
    url: String,
    signing_secret: Option<SecretString>,
}

impl WebhookRealtimeChannel {
    pub fn new(
        url: impl Into<String>,
        signing_secret: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RealtimeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RealtimeError::Transport(error.to_string()))?;
        Ok(Self { client, url: url.into(), signing_secret })
    }

    /// `None` when realtime delivery is disabled or no webhook is configured.
    pub fn from_config(config: &RealtimeConfig) -> Result<Option<Self>, RealtimeError> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(url) = config.webhook_url.as_deref() else {
            return Ok(None);
        };
        Self::new(url, config.signing_secret.clone(), Duration::from_secs(config.timeout_secs))
            .map(Some)
    }

    fn signature(&self, body: &[u8]) -> Option<String> {
        self.signing_secret
            .as_ref()
            .map(|secret| sign_payload(secret.expose_secret().as_bytes(), body))
    }
}

#[async_trait]
impl RealtimeChannel for WebhookRealtimeChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn push(&self, message: &RealtimeMessage) -> Result<(), RealtimeError> {
        let body =
            serde_json::to_vec(message).map_err(|error| RealtimeError::Encode(error.to_string()))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(signature) = self.signature(&body) {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|error| RealtimeError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(RealtimeError::Rejected { status: response.status().as_u16() });
        }
        Ok(())
    }
}
