use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use pushline_core::ChannelType;

use super::ChannelAdapter;
use crate::error::DeliveryError;
use crate::types::OutboundNotification;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_EXPO_URL: &str = "https://exp.host/--/api/v2/push/send";

/// Delivers notifications to Expo mobile push tokens.
pub struct ExpoPushAdapter {
    client: Client,
    push_url: String,
}

impl ExpoPushAdapter {
    pub fn new(push_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .connect_timeout(CALL_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            push_url: push_url.into(),
        }
    }
}

impl Default for ExpoPushAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_EXPO_URL)
    }
}

#[async_trait]
impl ChannelAdapter for ExpoPushAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::ExpoPush
    }

    async fn deliver(
        &self,
        endpoint: &str,
        outbound: &OutboundNotification,
    ) -> Result<(), DeliveryError> {
        let priority = if outbound.priority.is_high_urgency() {
            "high"
        } else {
            "default"
        };

        let payload = json!({
            "to": endpoint,
            "title": outbound.title.as_deref().unwrap_or(&outbound.topic),
            "body": outbound.message,
            "data": {
                "topic": outbound.topic,
                "messageId": outbound.message_id,
            },
            "sound": "default",
            "priority": priority,
        });

        let response = self
            .client
            .post(&self.push_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                message_id = %outbound.message_id,
                "Expo push delivery succeeded"
            );
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::SendFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )))
        }
    }
}
