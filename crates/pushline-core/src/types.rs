use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plan::Plan;

/// Message priority, five levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Parses a priority string, falling back to `Normal` for anything
    /// unrecognized. Inbound push headers are untrusted client input.
    pub fn parse_or_normal(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "lowest" => Self::Lowest,
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Normal,
        }
    }

    /// Maps a Pushover integer priority (-2..2) onto the five-level scale.
    pub fn from_pushover(p: i64) -> Self {
        match p {
            i64::MIN..=-2 => Self::Lowest,
            -1 => Self::Low,
            0 => Self::Normal,
            1 => Self::High,
            _ => Self::Urgent,
        }
    }

    /// Whether this priority maps to a gateway's "high" delivery class.
    pub fn is_high_urgency(&self) -> bool {
        matches!(self, Self::High | Self::Urgent)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscriber channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Webhook,
    Email,
    ExpoPush,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Email => "email",
            Self::ExpoPush => "expo_push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(Self::Webhook),
            "email" => Some(Self::Email),
            "expo_push" => Some(Self::ExpoPush),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account, keyed by the opaque user id owned by the external auth
/// provider. Created lazily on first topic creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub plan: Plan,
    pub pushes_used: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub pushes_reset_at: OffsetDateTime,
}

/// A topic: the addressable unit messages are pushed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    /// URL-safe, globally unique, lowercase alphanumeric + hyphens.
    pub name: String,
    pub user_id: String,
    pub is_private: bool,
    /// Generated once at creation, immutable. Bearer credential for private
    /// topics and the Pushover-compatible `token` lookup key.
    pub api_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A persisted notification message. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields of a message prior to persistence (id and timestamp are assigned
/// by the storage backend).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic_id: String,
    pub title: Option<String>,
    pub message: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub click_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A delivery subscriber attached to a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub topic_id: String,
    /// URL, email address, or Expo push token, depending on `channel`.
    pub endpoint: String,
    #[serde(rename = "type")]
    pub channel: ChannelType,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewSubscriber {
    pub topic_id: String,
    pub endpoint: String,
    pub channel: ChannelType,
}

/// Delivery attempt lifecycle.
///
/// `Failed` with a `next_attempt_at` is retryable; `Failed` without one is
/// permanent (attempt budget exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable record of one (message, subscriber) delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub message_id: String,
    pub subscriber_id: String,
    pub channel: ChannelType,
    pub endpoint: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewDeliveryAttempt {
    pub message_id: String,
    pub subscriber_id: String,
    pub channel: ChannelType,
    pub endpoint: String,
}

/// Normalizes a user-supplied topic name: lowercase, non `[a-z0-9-]` mapped
/// to hyphens, runs collapsed, leading/trailing hyphens trimmed.
///
/// Idempotent: sanitizing an already-sanitized name is a no-op. Returns
/// `None` when nothing survives.
pub fn sanitize_topic_name(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    let collapsed: String = {
        let mut s = String::with_capacity(out.len());
        let mut prev_hyphen = false;
        for c in out.chars() {
            if c == '-' {
                if !prev_hyphen {
                    s.push(c);
                }
                prev_hyphen = true;
            } else {
                s.push(c);
                prev_hyphen = false;
            }
        }
        s
    };
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
