use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use campus_types::models::NotificationChannel;

use crate::error::ProviderError;

/// One message handed to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRequest {
    pub to: String,
    pub channel: NotificationChannel,
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Sends a notification over one external channel. `Ok` carries the
/// provider's response, stored alongside the attempt.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<String, ProviderError>;
}

/// Posts the request as JSON to a configured URL; any 2xx is a delivery.
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    client: Client,
    url: String,
}

impl WebhookProvider {
    pub fn new(url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl DeliveryProvider for WebhookProvider {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<String, ProviderError> {
        debug!(channel = %request.channel, kind = %request.kind, "Posting notification to webhook");

        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ProviderError::Rejected { status: status.as_u16(), body });
        }
        Ok(body)
    }
}

/// Provider per channel. Channels without one fail their attempts.
#[derive(Clone, Default)]
pub struct Providers {
    by_channel: HashMap<NotificationChannel, Arc<dyn DeliveryProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: NotificationChannel, provider: Arc<dyn DeliveryProvider>) -> Self {
        self.by_channel.insert(channel, provider);
        self
    }

    pub fn get(&self, channel: NotificationChannel) -> Option<&Arc<dyn DeliveryProvider>> {
        self.by_channel.get(&channel)
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}
