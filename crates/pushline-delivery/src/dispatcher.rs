//! Concurrent fan-out of one message to a topic's active subscribers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use pushline_core::{DeliveryAttempt, Message, NewDeliveryAttempt, Subscriber, Topic};
use pushline_storage::DynStorage;

use crate::adapters::AdapterSet;
use crate::error::DeliveryError;
use crate::retry::next_retry_at;
use crate::types::{DispatchSummary, OutboundNotification};

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fans a stored message out to every active subscriber of its topic.
///
/// Deliveries run concurrently and every failure is isolated to its own
/// subscriber: the caller only ever learns how many subscribers were
/// targeted. Failed attempts stay on the books for the retry sweep.
pub struct Dispatcher {
    storage: DynStorage,
    adapters: Arc<AdapterSet>,
    dispatch_timeout: Duration,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(
        storage: DynStorage,
        adapters: Arc<AdapterSet>,
        dispatch_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            storage,
            adapters,
            dispatch_timeout,
            max_retries,
        }
    }

    /// Deliver `message` to every active subscriber of `topic`.
    ///
    /// Storage failures while loading subscribers propagate; everything
    /// after that is best-effort and recorded per attempt.
    pub async fn dispatch(
        &self,
        topic: &Topic,
        message: &Message,
    ) -> Result<DispatchSummary, pushline_storage::StorageError> {
        let subscribers = self.storage.subscribers().list_active(&topic.id).await?;
        let subscriber_count = subscribers.len();

        if subscribers.is_empty() {
            debug!(topic = %topic.name, message_id = %message.id, "No active subscribers");
            return Ok(DispatchSummary { subscriber_count });
        }

        let outbound = OutboundNotification::new(topic, message);

        let mut deliveries = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let attempt = NewDeliveryAttempt {
                message_id: message.id.clone(),
                subscriber_id: subscriber.id.clone(),
                channel: subscriber.channel,
                endpoint: subscriber.endpoint.clone(),
            };
            match self.storage.delivery_attempts().record_attempt(attempt).await {
                Ok(recorded) => deliveries.push(self.deliver_one(subscriber, recorded, &outbound)),
                Err(e) => {
                    warn!(
                        subscriber_id = %subscriber.id,
                        error = %e,
                        "Failed to record delivery attempt, skipping subscriber"
                    );
                }
            }
        }

        join_all(deliveries).await;

        Ok(DispatchSummary { subscriber_count })
    }

    /// One subscriber, one attempt. Never returns an error: outcomes land
    /// on the attempt record and in the log.
    async fn deliver_one(
        &self,
        subscriber: Subscriber,
        attempt: DeliveryAttempt,
        outbound: &OutboundNotification,
    ) {
        let adapter = self.adapters.for_channel(subscriber.channel);

        let result = match tokio::time::timeout(
            self.dispatch_timeout,
            adapter.deliver(&subscriber.endpoint, outbound),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.storage.delivery_attempts().mark_delivered(&attempt.id).await {
                    warn!(attempt_id = %attempt.id, error = %e, "Failed to mark attempt delivered");
                }
            }
            Err(delivery_err) => {
                warn!(
                    subscriber_id = %subscriber.id,
                    channel = %subscriber.channel.as_str(),
                    endpoint = %subscriber.endpoint,
                    error = %delivery_err,
                    "Delivery failed"
                );
                let next = next_retry_at(attempt.attempts, self.max_retries);
                if let Err(e) = self
                    .storage
                    .delivery_attempts()
                    .mark_failed(&attempt.id, &delivery_err.to_string(), next)
                    .await
                {
                    warn!(attempt_id = %attempt.id, error = %e, "Failed to mark attempt failed");
                }
            }
        }
    }
}
