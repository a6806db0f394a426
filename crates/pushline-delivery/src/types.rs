//! Types shared across the adapters and the dispatcher.

use pushline_core::{Message, Priority, Topic};
use time::OffsetDateTime;

/// The channel-independent view of a message handed to adapters.
#[derive(Debug, Clone)]
pub struct OutboundNotification {
    pub topic: String,
    pub message_id: String,
    pub title: Option<String>,
    pub message: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub click_url: Option<String>,
    pub created_at: OffsetDateTime,
}

impl OutboundNotification {
    pub fn new(topic: &Topic, message: &Message) -> Self {
        Self {
            topic: topic.name.clone(),
            message_id: message.id.clone(),
            title: message.title.clone(),
            message: message.message.clone(),
            priority: message.priority,
            tags: message.tags.clone(),
            click_url: message.click_url.clone(),
            created_at: message.created_at,
        }
    }
}

/// What the push caller learns about a dispatch: how many subscribers were
/// targeted, never per-subscriber outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSummary {
    pub subscriber_count: usize,
}
