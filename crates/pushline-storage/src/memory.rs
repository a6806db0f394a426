//! DashMap-backed storage, used by tests and local development.
//!
//! Per-key atomicity comes from DashMap's shard locks: `get_mut`/`entry`
//! hold the shard for the duration of the mutation, which is what the quota
//! and rate-limit counters need. Cross-record invariants (topic name
//! uniqueness, one subscriber per endpoint) are serialized through small
//! mutexes, which is acceptable at test scale.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use pushline_core::{
    Account, ChannelType, DeliveryAttempt, DeliveryStatus, Message, NewDeliveryAttempt,
    NewMessage, NewSubscriber, Plan, Subscriber, Topic, generate_api_key, generate_id,
};

use crate::error::StorageError;
use crate::traits::{
    AccountStorage, DeliveryAttemptStorage, MessageStorage, RateLimitStorage, Storage,
    SubscriberStorage, TopicStorage,
};
use crate::types::{AttemptCounts, QuotaDecision, RateLimitWindow};

#[derive(Debug, Clone, Copy)]
struct RateEntry {
    count: i64,
    reset_at: OffsetDateTime,
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    topics: DashMap<String, Topic>,
    messages: DashMap<String, Message>,
    subscribers: DashMap<String, Subscriber>,
    accounts: DashMap<String, Account>,
    rate_windows: DashMap<String, RateEntry>,
    attempts: DashMap<String, DeliveryAttempt>,
    topic_create_lock: Mutex<()>,
    subscriber_upsert_lock: Mutex<()>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicStorage for MemoryStorage {
    async fn create_topic(
        &self,
        name: &str,
        user_id: &str,
        is_private: bool,
    ) -> Result<Topic, StorageError> {
        let _guard = self
            .topic_create_lock
            .lock()
            .map_err(|_| StorageError::internal("topic lock poisoned"))?;
        if self.topics.iter().any(|t| t.name == name) {
            return Err(StorageError::already_exists("topic", name));
        }
        let topic = Topic {
            id: generate_id(),
            name: name.to_string(),
            user_id: user_id.to_string(),
            is_private,
            api_key: generate_api_key(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.topics.insert(topic.id.clone(), topic.clone());
        Ok(topic)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Topic>, StorageError> {
        Ok(self.topics.get(id).map(|t| t.clone()))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError> {
        Ok(self
            .topics
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.clone()))
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Topic>, StorageError> {
        Ok(self
            .topics
            .iter()
            .find(|t| t.api_key == api_key)
            .map(|t| t.clone()))
    }

    async fn find_public_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError> {
        Ok(self
            .topics
            .iter()
            .find(|t| t.name == name && !t.is_private)
            .map(|t| t.clone()))
    }

    async fn list_by_owner(&self, user_id: &str) -> Result<Vec<Topic>, StorageError> {
        let mut out: Vec<Topic> = self
            .topics
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn count_by_owner(&self, user_id: &str) -> Result<u32, StorageError> {
        Ok(self.topics.iter().filter(|t| t.user_id == user_id).count() as u32)
    }

    async fn delete_topic(&self, id: &str) -> Result<(), StorageError> {
        if self.topics.remove(id).is_none() {
            return Err(StorageError::not_found("topic", id));
        }
        let message_ids: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.topic_id == id)
            .map(|m| m.id.clone())
            .collect();
        for mid in &message_ids {
            self.messages.remove(mid);
        }
        self.subscribers.retain(|_, s| s.topic_id != id);
        self.attempts
            .retain(|_, a| !message_ids.contains(&a.message_id));
        Ok(())
    }
}

#[async_trait]
impl MessageStorage for MemoryStorage {
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        let stored = Message {
            id: generate_id(),
            topic_id: message.topic_id,
            title: message.title,
            message: message.message,
            priority: message.priority,
            tags: message.tags,
            click_url: message.click_url,
            metadata: message.metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        self.messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StorageError> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn list_recent(
        &self,
        topic_id: &str,
        since: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StorageError> {
        let mut out: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.topic_id == topic_id)
            .filter(|m| since.is_none_or(|s| m.created_at > s))
            .map(|m| m.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit as usize);
        Ok(out)
    }
}

#[async_trait]
impl SubscriberStorage for MemoryStorage {
    async fn upsert_subscriber(
        &self,
        sub: NewSubscriber,
    ) -> Result<(Subscriber, bool), StorageError> {
        let _guard = self
            .subscriber_upsert_lock
            .lock()
            .map_err(|_| StorageError::internal("subscriber lock poisoned"))?;
        let existing_id = self
            .subscribers
            .iter()
            .find(|s| s.topic_id == sub.topic_id && s.endpoint == sub.endpoint)
            .map(|s| s.id.clone());
        if let Some(id) = existing_id {
            let mut entry = self
                .subscribers
                .get_mut(&id)
                .ok_or_else(|| StorageError::not_found("subscriber", &id))?;
            entry.active = true;
            entry.channel = sub.channel;
            return Ok((entry.clone(), true));
        }
        let created = Subscriber {
            id: generate_id(),
            topic_id: sub.topic_id,
            endpoint: sub.endpoint,
            channel: sub.channel,
            active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.subscribers.insert(created.id.clone(), created.clone());
        Ok((created, false))
    }

    async fn list_subscribers(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError> {
        let mut out: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|s| s.topic_id == topic_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn list_active(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError> {
        Ok(self
            .subscribers
            .iter()
            .filter(|s| s.topic_id == topic_id && s.active)
            .map(|s| s.clone())
            .collect())
    }

    async fn deactivate_subscriber(&self, id: &str) -> Result<(), StorageError> {
        let mut entry = self
            .subscribers
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("subscriber", id))?;
        entry.active = false;
        Ok(())
    }

    async fn delete_subscriber(&self, id: &str) -> Result<(), StorageError> {
        self.subscribers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("subscriber", id))
    }
}

#[async_trait]
impl AccountStorage for MemoryStorage {
    async fn get_or_create_account(&self, user_id: &str) -> Result<Account, StorageError> {
        let entry = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Account {
                user_id: user_id.to_string(),
                plan: Plan::Free,
                pushes_used: 0,
                pushes_reset_at: pushline_core::next_month_start(OffsetDateTime::now_utc()),
            });
        Ok(entry.clone())
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.accounts.get(user_id).map(|a| a.clone()))
    }

    async fn reset_usage(
        &self,
        user_id: &str,
        next_reset: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let mut entry = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StorageError::not_found("account", user_id))?;
        entry.pushes_used = 0;
        entry.pushes_reset_at = next_reset;
        Ok(())
    }

    async fn try_consume_push(
        &self,
        user_id: &str,
        plan: Plan,
        limit: i64,
    ) -> Result<QuotaDecision, StorageError> {
        // Shard lock held across the compare-and-increment.
        let mut entry = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StorageError::not_found("account", user_id))?;
        if entry.pushes_used >= limit {
            return Ok(QuotaDecision::Exceeded {
                plan,
                used: entry.pushes_used,
                limit,
            });
        }
        entry.pushes_used += 1;
        Ok(QuotaDecision::Admitted {
            used: entry.pushes_used,
        })
    }

    async fn set_plan(&self, user_id: &str, plan: Plan) -> Result<(), StorageError> {
        let mut entry = self
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| StorageError::not_found("account", user_id))?;
        entry.plan = plan;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStorage for MemoryStorage {
    async fn increment(&self, key: &str, window_ms: i64) -> Result<RateLimitWindow, StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut entry = self
            .rate_windows
            .entry(key.to_string())
            .or_insert(RateEntry {
                count: 0,
                reset_at: now + time::Duration::milliseconds(window_ms),
            });
        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + time::Duration::milliseconds(window_ms);
        }
        entry.count += 1;
        let reset_in_ms = ((entry.reset_at - now).whole_milliseconds() as i64).max(0);
        Ok(RateLimitWindow {
            count: entry.count,
            reset_in_ms,
        })
    }
}

#[async_trait]
impl DeliveryAttemptStorage for MemoryStorage {
    async fn record_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Result<DeliveryAttempt, StorageError> {
        let stored = DeliveryAttempt {
            id: generate_id(),
            message_id: attempt.message_id,
            subscriber_id: attempt.subscriber_id,
            channel: attempt.channel,
            endpoint: attempt.endpoint,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.attempts.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn mark_delivered(&self, id: &str) -> Result<(), StorageError> {
        let mut entry = self
            .attempts
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("delivery attempt", id))?;
        entry.status = DeliveryStatus::Delivered;
        entry.attempts += 1;
        entry.next_attempt_at = None;
        entry.last_error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<(), StorageError> {
        let mut entry = self
            .attempts
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("delivery attempt", id))?;
        entry.status = DeliveryStatus::Failed;
        entry.attempts += 1;
        entry.next_attempt_at = next_attempt_at;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let now = OffsetDateTime::now_utc();
        let due_ids: Vec<String> = self
            .attempts
            .iter()
            .filter(|a| {
                a.status == DeliveryStatus::Failed
                    && a.next_attempt_at.is_some_and(|t| t <= now)
            })
            .take(limit as usize)
            .map(|a| a.id.clone())
            .collect();
        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(mut entry) = self.attempts.get_mut(&id) {
                // Clearing the schedule removes it from other sweepers' view.
                if entry.next_attempt_at.take().is_some() {
                    claimed.push(entry.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn counts_for_message(&self, message_id: &str) -> Result<AttemptCounts, StorageError> {
        let mut counts = AttemptCounts::default();
        for a in self.attempts.iter().filter(|a| a.message_id == message_id) {
            match a.status {
                DeliveryStatus::Pending => counts.pending += 1,
                DeliveryStatus::Delivered => counts.delivered += 1,
                DeliveryStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

impl Storage for MemoryStorage {
    fn topics(&self) -> &dyn TopicStorage {
        self
    }
    fn messages(&self) -> &dyn MessageStorage {
        self
    }
    fn subscribers(&self) -> &dyn SubscriberStorage {
        self
    }
    fn accounts(&self) -> &dyn AccountStorage {
        self
    }
    fn rate_limits(&self) -> &dyn RateLimitStorage {
        self
    }
    fn delivery_attempts(&self) -> &dyn DeliveryAttemptStorage {
        self
    }
    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topic_names_are_unique() {
        let store = MemoryStorage::new();
        store.create_topic("alerts", "u1", false).await.unwrap();
        let err = store.create_topic("alerts", "u2", false).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn upsert_reactivates_existing_endpoint() {
        let store = MemoryStorage::new();
        let topic = store.create_topic("alerts", "u1", false).await.unwrap();
        let (first, updated) = store
            .upsert_subscriber(NewSubscriber {
                topic_id: topic.id.clone(),
                endpoint: "https://example.com/hook".into(),
                channel: ChannelType::Webhook,
            })
            .await
            .unwrap();
        assert!(!updated);
        store.deactivate_subscriber(&first.id).await.unwrap();

        let (second, updated) = store
            .upsert_subscriber(NewSubscriber {
                topic_id: topic.id.clone(),
                endpoint: "https://example.com/hook".into(),
                channel: ChannelType::Email,
            })
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(second.id, first.id);
        assert!(second.active);
        assert_eq!(second.channel, ChannelType::Email);
        assert_eq!(store.list_subscribers(&topic.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_is_conditional_on_limit() {
        let store = MemoryStorage::new();
        store.get_or_create_account("u1").await.unwrap();
        for i in 1..=3 {
            match store.try_consume_push("u1", Plan::Free, 3).await.unwrap() {
                QuotaDecision::Admitted { used } => assert_eq!(used, i),
                QuotaDecision::Exceeded { .. } => panic!("admitted pushes rejected"),
            }
        }
        assert!(matches!(
            store.try_consume_push("u1", Plan::Free, 3).await.unwrap(),
            QuotaDecision::Exceeded { used: 3, limit: 3, .. }
        ));
    }

    #[tokio::test]
    async fn rate_window_counts_and_resets() {
        let store = MemoryStorage::new();
        let w = store.increment("push:1.2.3.4", 60_000).await.unwrap();
        assert_eq!(w.count, 1);
        let w = store.increment("push:1.2.3.4", 60_000).await.unwrap();
        assert_eq!(w.count, 2);
        assert!(w.reset_in_ms <= 60_000);
        // Different key, independent window.
        let w = store.increment("push:5.6.7.8", 60_000).await.unwrap();
        assert_eq!(w.count, 1);
    }

    #[tokio::test]
    async fn claim_due_skips_future_and_permanent_failures() {
        let store = MemoryStorage::new();
        let a = store
            .record_attempt(NewDeliveryAttempt {
                message_id: "m1".into(),
                subscriber_id: "s1".into(),
                channel: ChannelType::Webhook,
                endpoint: "https://example.com/hook".into(),
            })
            .await
            .unwrap();
        let b = store
            .record_attempt(NewDeliveryAttempt {
                message_id: "m1".into(),
                subscriber_id: "s2".into(),
                channel: ChannelType::Webhook,
                endpoint: "https://example.com/hook2".into(),
            })
            .await
            .unwrap();
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(5);
        store.mark_failed(&a.id, "timeout", Some(past)).await.unwrap();
        // Permanent failure: no schedule.
        store.mark_failed(&b.id, "gone", None).await.unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, a.id);
        // Claimed attempts are not visible to a second sweep.
        assert!(store.claim_due(10).await.unwrap().is_empty());
    }
}
