//! Storage traits every backend must implement.
//!
//! All traits are object-safe and `Send + Sync`; handlers and the delivery
//! pipeline only ever see `&dyn` references obtained through [`Storage`].

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use pushline_core::{
    Account, DeliveryAttempt, Message, NewDeliveryAttempt, NewMessage, NewSubscriber, Plan,
    Subscriber, Topic,
};

use crate::error::StorageError;
use crate::types::{AttemptCounts, QuotaDecision, RateLimitWindow};

/// Topic lookup and lifecycle.
#[async_trait]
pub trait TopicStorage: Send + Sync {
    /// Creates a topic with a freshly generated id and api_key.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` when the name is taken.
    async fn create_topic(
        &self,
        name: &str,
        user_id: &str,
        is_private: bool,
    ) -> Result<Topic, StorageError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Topic>, StorageError>;

    /// Looks up a topic by its unique name.
    async fn find_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError>;

    /// Looks up a topic by its api_key (Pushover-compatible `token` path).
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Topic>, StorageError>;

    /// Looks up a *public* topic by name. Used as the Pushover `user`
    /// fallback when the token does not match any api_key.
    async fn find_public_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError>;

    async fn list_by_owner(&self, user_id: &str) -> Result<Vec<Topic>, StorageError>;

    async fn count_by_owner(&self, user_id: &str) -> Result<u32, StorageError>;

    /// Deletes a topic, cascading to its messages, subscribers, and
    /// delivery attempts.
    async fn delete_topic(&self, id: &str) -> Result<(), StorageError>;
}

/// Message persistence and history reads.
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Persists a message, assigning its id and timestamp.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StorageError>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StorageError>;

    /// Recent messages for a topic, newest first. `since` is an exclusive
    /// lower bound on `created_at`. Callers cap `limit`.
    async fn list_recent(
        &self,
        topic_id: &str,
        since: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StorageError>;
}

/// Subscriber management. At most one row per (topic, endpoint).
#[async_trait]
pub trait SubscriberStorage: Send + Sync {
    /// Creates a subscriber, or reactivates and retypes the existing row for
    /// the same (topic, endpoint). Returns the row and whether it was an
    /// update of an existing one.
    async fn upsert_subscriber(
        &self,
        sub: NewSubscriber,
    ) -> Result<(Subscriber, bool), StorageError>;

    async fn list_subscribers(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError>;

    /// Only `active` subscribers receive deliveries.
    async fn list_active(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError>;

    async fn deactivate_subscriber(&self, id: &str) -> Result<(), StorageError>;

    async fn delete_subscriber(&self, id: &str) -> Result<(), StorageError>;
}

/// Account state and the quota counter.
#[async_trait]
pub trait AccountStorage: Send + Sync {
    /// Fetches the account, creating it on the free plan if absent.
    async fn get_or_create_account(&self, user_id: &str) -> Result<Account, StorageError>;

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StorageError>;

    /// Resets `pushes_used` to 0 and advances `pushes_reset_at`. Persisted
    /// immediately, even if the current request is later rejected.
    async fn reset_usage(
        &self,
        user_id: &str,
        next_reset: OffsetDateTime,
    ) -> Result<(), StorageError>;

    /// Atomic conditional increment: admits and increments in one step when
    /// `pushes_used < limit`, otherwise rejects without incrementing. Never
    /// a read-modify-write in the caller.
    async fn try_consume_push(
        &self,
        user_id: &str,
        plan: Plan,
        limit: i64,
    ) -> Result<QuotaDecision, StorageError>;

    async fn set_plan(&self, user_id: &str, plan: Plan) -> Result<(), StorageError>;
}

/// Shared rate-limit counters.
///
/// Counters live in the storage backend, never process memory: the pipeline
/// may run as many concurrent instances with no shared address space.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Atomically increments the counter for `key`, starting a fresh window
    /// of `window_ms` when none is active or the previous one expired.
    async fn increment(&self, key: &str, window_ms: i64) -> Result<RateLimitWindow, StorageError>;
}

/// Durable per-(message, subscriber) delivery records.
#[async_trait]
pub trait DeliveryAttemptStorage: Send + Sync {
    /// Records a new `pending` attempt.
    async fn record_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Result<DeliveryAttempt, StorageError>;

    async fn mark_delivered(&self, id: &str) -> Result<(), StorageError>;

    /// Marks an attempt failed. With `next_attempt_at` set the attempt is
    /// eligible for the retry sweep; without it the failure is permanent.
    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<(), StorageError>;

    /// Claims failed attempts whose `next_attempt_at` has passed, removing
    /// them from other sweepers' view for this pass.
    async fn claim_due(&self, limit: u32) -> Result<Vec<DeliveryAttempt>, StorageError>;

    async fn counts_for_message(&self, message_id: &str) -> Result<AttemptCounts, StorageError>;
}

/// Bundle of all stores a backend provides.
pub trait Storage: Send + Sync {
    fn topics(&self) -> &dyn TopicStorage;
    fn messages(&self) -> &dyn MessageStorage;
    fn subscribers(&self) -> &dyn SubscriberStorage;
    fn accounts(&self) -> &dyn AccountStorage;
    fn rate_limits(&self) -> &dyn RateLimitStorage;
    fn delivery_attempts(&self) -> &dyn DeliveryAttemptStorage;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Type alias for a shareable storage instance.
pub type DynStorage = Arc<dyn Storage>;

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time object-safety checks.
    fn _assert_storage_object_safe(_: &dyn Storage) {}
    fn _assert_topic_object_safe(_: &dyn TopicStorage) {}
    fn _assert_rate_limit_object_safe(_: &dyn RateLimitStorage) {}
}
