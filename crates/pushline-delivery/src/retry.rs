//! Background sweep that re-delivers failed attempts.
//!
//! Failed attempts carry a `next_attempt_at` schedule; the sweep claims the
//! due ones in batches and tries again through the same adapters, so failed
//! deliveries survive process restarts.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use pushline_core::DeliveryAttempt;
use pushline_storage::{DynStorage, StorageError};

use crate::adapters::AdapterSet;
use crate::types::OutboundNotification;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_BATCH: u32 = 50;

/// When the next retry should run, or `None` once the attempt budget is
/// spent. Backoff doubles per attempt: 60s, 120s, 240s, 480s, 960s.
pub fn next_retry_at(attempts: u32, max_retries: u32) -> Option<OffsetDateTime> {
    if attempts >= max_retries {
        return None;
    }
    let backoff_secs = 60 * 2_i64.pow(attempts.min(30));
    Some(OffsetDateTime::now_utc() + time::Duration::seconds(backoff_secs))
}

/// Periodically re-delivers due failed attempts.
pub struct RetrySweeper {
    storage: DynStorage,
    adapters: Arc<AdapterSet>,
    batch_size: u32,
    poll_interval: Duration,
    call_timeout: Duration,
    max_retries: u32,
}

impl RetrySweeper {
    pub fn new(
        storage: DynStorage,
        adapters: Arc<AdapterSet>,
        batch_size: u32,
        poll_interval: Duration,
        call_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            storage,
            adapters,
            batch_size,
            poll_interval,
            call_timeout,
            max_retries,
        }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);

        info!(interval_secs = self.poll_interval.as_secs(), "Retry sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retry sweeper stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(retried) if retried > 0 => {
                            info!(count = retried, "Retried delivery attempts");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Retry sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// One pass: claim due attempts and re-deliver each. Returns how many
    /// attempts were processed.
    ///
    /// Claiming clears the attempt's schedule, so a bookkeeping failure on
    /// one attempt must not abort the rest of the batch: the attempt is
    /// put back on the schedule and the sweep moves on.
    pub async fn sweep_once(&self) -> Result<u32, StorageError> {
        let due = self
            .storage
            .delivery_attempts()
            .claim_due(self.batch_size)
            .await?;
        let mut processed = 0;

        for attempt in due {
            if let Err(e) = self.retry_one(&attempt).await {
                warn!(
                    attempt_id = %attempt.id,
                    error = %e,
                    "Retry bookkeeping failed, rescheduling attempt"
                );
                let next = next_retry_at(attempt.attempts, self.max_retries);
                if let Err(e) = self
                    .storage
                    .delivery_attempts()
                    .mark_failed(&attempt.id, "Retry interrupted by a storage error", next)
                    .await
                {
                    error!(attempt_id = %attempt.id, error = %e, "Could not reschedule attempt");
                }
            }
            processed += 1;
        }

        Ok(processed)
    }

    async fn retry_one(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        let Some(message) = self
            .storage
            .messages()
            .get_message(&attempt.message_id)
            .await?
        else {
            // Message deleted underneath the attempt; nothing left to send.
            return self
                .storage
                .delivery_attempts()
                .mark_failed(&attempt.id, "Message no longer exists", None)
                .await;
        };
        let Some(topic) = self.storage.topics().find_by_id(&message.topic_id).await? else {
            return self
                .storage
                .delivery_attempts()
                .mark_failed(&attempt.id, "Topic no longer exists", None)
                .await;
        };

        let outbound = OutboundNotification::new(&topic, &message);
        let adapter = self.adapters.for_channel(attempt.channel);

        let result = match tokio::time::timeout(
            self.call_timeout,
            adapter.deliver(&attempt.endpoint, &outbound),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::error::DeliveryError::Timeout),
        };

        match result {
            Ok(()) => {
                self.storage
                    .delivery_attempts()
                    .mark_delivered(&attempt.id)
                    .await
            }
            Err(e) => {
                let next = next_retry_at(attempt.attempts, self.max_retries);
                warn!(
                    attempt_id = %attempt.id,
                    endpoint = %attempt.endpoint,
                    attempts = attempt.attempts,
                    error = %e,
                    permanent = next.is_none(),
                    "Retry delivery failed"
                );
                self.storage
                    .delivery_attempts()
                    .mark_failed(&attempt.id, &e.to_string(), next)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{EmailAdapter, ExpoPushAdapter, SmtpConfig, WebhookAdapter};
    use pushline_core::{ChannelType, Message, NewDeliveryAttempt, NewMessage, Priority};
    use pushline_storage::{
        AccountStorage, DeliveryAttemptStorage, MemoryStorage, MessageStorage, RateLimitStorage,
        Storage, SubscriberStorage, TopicStorage,
    };
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backoff_doubles_then_goes_permanent() {
        let first = next_retry_at(0, 5).unwrap();
        let second = next_retry_at(1, 5).unwrap();
        let now = OffsetDateTime::now_utc();
        assert!(first - now <= time::Duration::seconds(61));
        assert!(second - now >= time::Duration::seconds(119));
        assert!(next_retry_at(5, 5).is_none());
        assert!(next_retry_at(7, 5).is_none());
    }

    fn sweeper(storage: DynStorage) -> RetrySweeper {
        sweeper_with_timeout(storage, Duration::from_secs(5))
    }

    fn sweeper_with_timeout(storage: DynStorage, call_timeout: Duration) -> RetrySweeper {
        let adapters = Arc::new(AdapterSet::new(
            WebhookAdapter::new(),
            EmailAdapter::new(SmtpConfig::default()),
            ExpoPushAdapter::default(),
        ));
        RetrySweeper::new(storage, adapters, 10, Duration::from_secs(30), call_timeout, 5)
    }

    async fn seed_due_attempt(storage: &dyn Storage, topic_name: &str, endpoint: &str) -> String {
        let topic = storage
            .topics()
            .create_topic(topic_name, "u1", false)
            .await
            .unwrap();
        let message = storage
            .messages()
            .insert_message(NewMessage {
                topic_id: topic.id.clone(),
                title: None,
                message: "retry me".into(),
                priority: Priority::Normal,
                tags: vec![],
                click_url: None,
                metadata: None,
            })
            .await
            .unwrap();
        let attempt = storage
            .delivery_attempts()
            .record_attempt(NewDeliveryAttempt {
                message_id: message.id.clone(),
                subscriber_id: "s1".into(),
                channel: ChannelType::Webhook,
                endpoint: endpoint.into(),
            })
            .await
            .unwrap();
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        storage
            .delivery_attempts()
            .mark_failed(&attempt.id, "connection refused", Some(past))
            .await
            .unwrap();
        message.id
    }

    #[tokio::test]
    async fn test_sweep_redelivers_due_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage: DynStorage = Arc::new(MemoryStorage::default());
        let message_id = seed_due_attempt(storage.as_ref(), "alerts", &server.uri()).await;

        let retried = sweeper(storage.clone()).sweep_once().await.unwrap();
        assert_eq!(retried, 1);

        let counts = storage
            .delivery_attempts()
            .counts_for_message(&message_id)
            .await
            .unwrap();
        assert_eq!(counts.delivered, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_slow_endpoint_is_cut_off_and_rescheduled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let storage: DynStorage = Arc::new(MemoryStorage::default());
        let message_id = seed_due_attempt(storage.as_ref(), "slow", &server.uri()).await;

        let sweeper = sweeper_with_timeout(storage.clone(), Duration::from_millis(100));
        let retried = sweeper.sweep_once().await.unwrap();
        assert_eq!(retried, 1);

        let counts = storage
            .delivery_attempts()
            .counts_for_message(&message_id)
            .await
            .unwrap();
        assert_eq!(counts.delivered, 0);
        assert_eq!(counts.failed, 1);
    }

    /// Message lookups error for one id; everything else delegates.
    struct PoisonedMessages {
        inner: Arc<MemoryStorage>,
        poisoned_id: String,
    }

    #[async_trait::async_trait]
    impl MessageStorage for PoisonedMessages {
        async fn insert_message(&self, new: NewMessage) -> Result<Message, StorageError> {
            self.inner.messages().insert_message(new).await
        }

        async fn get_message(&self, id: &str) -> Result<Option<Message>, StorageError> {
            if id == self.poisoned_id {
                return Err(StorageError::internal("message row unreadable"));
            }
            self.inner.messages().get_message(id).await
        }

        async fn list_recent(
            &self,
            topic_id: &str,
            since: Option<OffsetDateTime>,
            limit: u32,
        ) -> Result<Vec<Message>, StorageError> {
            self.inner.messages().list_recent(topic_id, since, limit).await
        }
    }

    struct PoisonedStorage {
        inner: Arc<MemoryStorage>,
        messages: PoisonedMessages,
    }

    impl PoisonedStorage {
        fn new(inner: Arc<MemoryStorage>, poisoned_id: String) -> Self {
            Self {
                messages: PoisonedMessages {
                    inner: inner.clone(),
                    poisoned_id,
                },
                inner,
            }
        }
    }

    impl Storage for PoisonedStorage {
        fn topics(&self) -> &dyn TopicStorage {
            self.inner.topics()
        }
        fn messages(&self) -> &dyn MessageStorage {
            &self.messages
        }
        fn subscribers(&self) -> &dyn SubscriberStorage {
            self.inner.subscribers()
        }
        fn accounts(&self) -> &dyn AccountStorage {
            self.inner.accounts()
        }
        fn rate_limits(&self) -> &dyn RateLimitStorage {
            self.inner.rate_limits()
        }
        fn delivery_attempts(&self) -> &dyn DeliveryAttemptStorage {
            self.inner.delivery_attempts()
        }
        fn backend_name(&self) -> &'static str {
            self.inner.backend_name()
        }
    }

    #[tokio::test]
    async fn test_one_bad_attempt_does_not_block_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let memory = Arc::new(MemoryStorage::default());
        let base: DynStorage = memory.clone();
        let poisoned_id = seed_due_attempt(base.as_ref(), "first", &server.uri()).await;
        let healthy_id = seed_due_attempt(base.as_ref(), "second", &server.uri()).await;

        let storage: DynStorage = Arc::new(PoisonedStorage::new(memory, poisoned_id.clone()));
        let retried = sweeper(storage.clone()).sweep_once().await.unwrap();
        assert_eq!(retried, 2);

        // The healthy attempt went through despite the earlier error.
        let counts = storage
            .delivery_attempts()
            .counts_for_message(&healthy_id)
            .await
            .unwrap();
        assert_eq!(counts.delivered, 1);

        // The poisoned attempt is back on the schedule, not stranded.
        let counts = storage
            .delivery_attempts()
            .counts_for_message(&poisoned_id)
            .await
            .unwrap();
        assert_eq!(counts.failed, 1);
        assert!(storage.delivery_attempts().claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_due_is_idle() {
        let storage: DynStorage = Arc::new(MemoryStorage::default());
        let retried = sweeper(storage).sweep_once().await.unwrap();
        assert_eq!(retried, 0);
    }
}
