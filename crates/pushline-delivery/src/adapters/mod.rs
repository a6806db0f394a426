pub mod email;
pub mod expo;
pub mod webhook;

use async_trait::async_trait;

use pushline_core::ChannelType;

use crate::error::DeliveryError;
use crate::types::OutboundNotification;

/// Adapter for one delivery channel.
///
/// Adapters are stateless and make exactly one delivery attempt per call;
/// retries are the sweep's business, not theirs.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> ChannelType;

    /// Deliver one notification to one endpoint.
    async fn deliver(
        &self,
        endpoint: &str,
        outbound: &OutboundNotification,
    ) -> Result<(), DeliveryError>;
}

/// One adapter per channel, shared by the dispatcher and the retry sweep.
pub struct AdapterSet {
    webhook: WebhookAdapter,
    email: EmailAdapter,
    expo: ExpoPushAdapter,
}

impl AdapterSet {
    pub fn new(webhook: WebhookAdapter, email: EmailAdapter, expo: ExpoPushAdapter) -> Self {
        Self {
            webhook,
            email,
            expo,
        }
    }

    pub fn for_channel(&self, channel: ChannelType) -> &dyn ChannelAdapter {
        match channel {
            ChannelType::Webhook => &self.webhook,
            ChannelType::Email => &self.email,
            ChannelType::ExpoPush => &self.expo,
        }
    }
}

pub use email::{EmailAdapter, SmtpConfig};
pub use expo::ExpoPushAdapter;
pub use webhook::WebhookAdapter;
