use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use pushline_core::ChannelType;

use super::ChannelAdapter;
use crate::error::DeliveryError;
use crate::types::OutboundNotification;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers notifications as an HTTP POST with a JSON body.
pub struct WebhookAdapter {
    client: Client,
}

impl WebhookAdapter {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(CALL_TIMEOUT)
            .connect_timeout(CALL_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    /// Create with a custom client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn deliver(
        &self,
        endpoint: &str,
        outbound: &OutboundNotification,
    ) -> Result<(), DeliveryError> {
        let timestamp = outbound
            .created_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();

        let payload = json!({
            "topic": outbound.topic,
            "title": outbound.title,
            "message": outbound.message,
            "priority": outbound.priority,
            "tags": outbound.tags,
            "click_url": outbound.click_url,
            "timestamp": timestamp,
            "id": outbound.message_id,
        });

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                endpoint = endpoint,
                status = status.as_u16(),
                message_id = %outbound.message_id,
                "Webhook delivery succeeded"
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

#[cfg(test)]
mod tests {
    use super::*;
    use pushline_core::Priority;
    use time::OffsetDateTime;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outbound() -> OutboundNotification {
        OutboundNotification {
            topic: "sensors".into(),
            message_id: "msg-1".into(),
            title: Some("Alert".into()),
            message: "Temperature high".into(),
            priority: Priority::High,
            tags: vec!["warning".into()],
            click_url: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "topic": "sensors",
                "message": "Temperature high",
                "priority": "high",
                "id": "msg-1",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new();
        let result = adapter
            .deliver(&format!("{}/hook", server.uri()), &outbound())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = WebhookAdapter::new();
        let result = adapter.deliver(&server.uri(), &outbound()).await;
        assert!(matches!(result, Err(DeliveryError::SendFailed(_))));
    }
}
