use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType, transport::smtp::authentication::Credentials,
};
use serde::{Deserialize, Serialize};

use pushline_core::{ChannelType, Priority};

const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

use super::ChannelAdapter;
use crate::error::DeliveryError;
use crate::types::OutboundNotification;

/// SMTP relay settings. All optional: an unconfigured relay turns email
/// delivery into a logged no-op rather than a hard failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Delivers notifications as HTML email over SMTP.
pub struct EmailAdapter {
    config: SmtpConfig,
}

impl EmailAdapter {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn priority_color(priority: Priority) -> &'static str {
        match priority {
            Priority::Urgent => "#ef4444",
            Priority::High => "#f97316",
            _ => "#6b7280",
        }
    }

    fn render_html(outbound: &OutboundNotification) -> String {
        let color = Self::priority_color(outbound.priority);
        let title_block = outbound
            .title
            .as_deref()
            .map(|t| format!("<h2 style=\"margin:0 0 8px 0;\">{t}</h2>"))
            .unwrap_or_default();
        format!(
            "<div style=\"font-family:sans-serif;max-width:480px;\">\
             <p style=\"margin:0 0 12px 0;\">\
             <span style=\"background:#eef2ff;border-radius:4px;padding:2px 8px;font-size:12px;\">{topic}</span> \
             <span style=\"background:{color};color:#fff;border-radius:4px;padding:2px 8px;font-size:12px;\">{priority}</span>\
             </p>\
             {title_block}\
             <p style=\"margin:0;white-space:pre-wrap;\">{message}</p>\
             </div>",
            topic = outbound.topic,
            priority = outbound.priority,
            message = outbound.message,
        )
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn deliver(
        &self,
        endpoint: &str,
        outbound: &OutboundNotification,
    ) -> Result<(), DeliveryError> {
        let (Some(host), Some(from)) = (&self.config.host, &self.config.from) else {
            tracing::warn!(
                endpoint = endpoint,
                message_id = %outbound.message_id,
                "SMTP relay not configured, skipping email delivery"
            );
            return Ok(());
        };

        let subject = outbound
            .title
            .clone()
            .unwrap_or_else(|| format!("Notification from {}", outbound.topic));

        let email = Message::builder()
            .from(
                from.parse()
                    .map_err(|e| DeliveryError::NotConfigured(format!("Invalid from: {e}")))?,
            )
            .to(endpoint
                .parse()
                .map_err(|e| DeliveryError::InvalidEndpoint(format!("{endpoint}: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(Self::render_html(outbound))
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| DeliveryError::NotConfigured(e.to_string()))?
            .port(self.config.port)
            .timeout(Some(CALL_TIMEOUT));

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = builder.build();

        mailer
            .send(email)
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        tracing::debug!(
            endpoint = endpoint,
            message_id = %outbound.message_id,
            "Email delivery succeeded"
        );
        Ok(())
    }
}
