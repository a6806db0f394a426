//! PostgreSQL implementations of the Pushline storage traits.
//!
//! The quota and rate-limit counters are single atomic statements: the
//! conditional increment happens inside the database, never as a
//! read-modify-write in the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;

use pushline_core::{
    Account, ChannelType, DeliveryAttempt, DeliveryStatus, Message, NewDeliveryAttempt,
    NewMessage, NewSubscriber, Plan, Priority, Subscriber, Topic, generate_api_key, generate_id,
    next_month_start,
};
use pushline_storage::{
    AccountStorage, AttemptCounts, DeliveryAttemptStorage, MessageStorage, QuotaDecision,
    RateLimitStorage, RateLimitWindow, Storage, StorageError, SubscriberStorage, TopicStorage,
};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, is_unique_violation};
use crate::pool::create_pool;
use crate::schema::ensure_schema;

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connects to PostgreSQL and bootstraps the schema.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PostgresError> {
        let pool = create_pool(config).await?;
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool. The schema is assumed to exist.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn chrono_to_time(dt: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(dt.timestamp()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(i64::from(dt.timestamp_subsec_nanos()))
}

fn time_to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_else(Utc::now)
}

fn parse_plan(s: &str) -> Plan {
    match s {
        "pro" => Plan::Pro,
        "business" => Plan::Business,
        _ => Plan::Free,
    }
}

fn parse_channel(s: &str) -> Result<ChannelType, StorageError> {
    ChannelType::parse(s)
        .ok_or_else(|| StorageError::internal(format!("unknown channel type in database: {s}")))
}

fn parse_status(s: &str) -> Result<DeliveryStatus, StorageError> {
    DeliveryStatus::parse(s)
        .ok_or_else(|| StorageError::internal(format!("unknown delivery status in database: {s}")))
}

type TopicRow = (String, String, String, bool, String, DateTime<Utc>);

fn topic_from_row(row: TopicRow) -> Topic {
    Topic {
        id: row.0,
        name: row.1,
        user_id: row.2,
        is_private: row.3,
        api_key: row.4,
        created_at: chrono_to_time(row.5),
    }
}

const TOPIC_COLS: &str = "id, name, user_id, is_private, api_key, created_at";

type MessageRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Value,
    Option<String>,
    Option<Value>,
    DateTime<Utc>,
);

fn message_from_row(row: MessageRow) -> Message {
    let tags = row
        .5
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Message {
        id: row.0,
        topic_id: row.1,
        title: row.2,
        message: row.3,
        priority: Priority::parse_or_normal(&row.4),
        tags,
        click_url: row.6,
        metadata: row.7,
        created_at: chrono_to_time(row.8),
    }
}

const MESSAGE_COLS: &str =
    "id, topic_id, title, message, priority, tags, click_url, metadata, created_at";

type AttemptRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i32,
    Option<DateTime<Utc>>,
    Option<String>,
    DateTime<Utc>,
);

fn attempt_from_row(row: AttemptRow) -> Result<DeliveryAttempt, StorageError> {
    Ok(DeliveryAttempt {
        id: row.0,
        message_id: row.1,
        subscriber_id: row.2,
        channel: parse_channel(&row.3)?,
        endpoint: row.4,
        status: parse_status(&row.5)?,
        attempts: row.6.max(0) as u32,
        next_attempt_at: row.7.map(chrono_to_time),
        last_error: row.8,
        created_at: chrono_to_time(row.9),
    })
}

const ATTEMPT_COLS: &str = "id, message_id, subscriber_id, channel, endpoint, status, attempts, next_attempt_at, last_error, created_at";

fn internal(context: &str, e: sqlx_core::error::Error) -> StorageError {
    StorageError::internal(format!("{context}: {e}"))
}

#[async_trait]
impl TopicStorage for PostgresStorage {
    async fn create_topic(
        &self,
        name: &str,
        user_id: &str,
        is_private: bool,
    ) -> Result<Topic, StorageError> {
        let id = generate_id();
        let api_key = generate_api_key();
        let sql = format!(
            "INSERT INTO pl_topics (id, name, user_id, is_private, api_key)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {TOPIC_COLS}"
        );
        let row: TopicRow = query_as(&sql)
            .bind(&id)
            .bind(name)
            .bind(user_id)
            .bind(is_private)
            .bind(&api_key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::already_exists("topic", name)
                } else {
                    internal("Failed to create topic", e)
                }
            })?;
        Ok(topic_from_row(row))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Topic>, StorageError> {
        let sql = format!("SELECT {TOPIC_COLS} FROM pl_topics WHERE id = $1");
        let row: Option<TopicRow> = query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("Failed to look up topic", e))?;
        Ok(row.map(topic_from_row))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError> {
        let sql = format!("SELECT {TOPIC_COLS} FROM pl_topics WHERE name = $1");
        let row: Option<TopicRow> = query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("Failed to look up topic by name", e))?;
        Ok(row.map(topic_from_row))
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Topic>, StorageError> {
        let sql = format!("SELECT {TOPIC_COLS} FROM pl_topics WHERE api_key = $1");
        let row: Option<TopicRow> = query_as(&sql)
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("Failed to look up topic by api_key", e))?;
        Ok(row.map(topic_from_row))
    }

    async fn find_public_by_name(&self, name: &str) -> Result<Option<Topic>, StorageError> {
        let sql =
            format!("SELECT {TOPIC_COLS} FROM pl_topics WHERE name = $1 AND is_private = FALSE");
        let row: Option<TopicRow> = query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("Failed to look up public topic", e))?;
        Ok(row.map(topic_from_row))
    }

    async fn list_by_owner(&self, user_id: &str) -> Result<Vec<Topic>, StorageError> {
        let sql = format!(
            "SELECT {TOPIC_COLS} FROM pl_topics WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<TopicRow> = query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("Failed to list topics", e))?;
        Ok(rows.into_iter().map(topic_from_row).collect())
    }

    async fn count_by_owner(&self, user_id: &str) -> Result<u32, StorageError> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM pl_topics WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| internal("Failed to count topics", e))?;
        Ok(count.max(0) as u32)
    }

    async fn delete_topic(&self, id: &str) -> Result<(), StorageError> {
        // Messages, subscribers, and attempts cascade via foreign keys.
        let result = query("DELETE FROM pl_topics WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| internal("Failed to delete topic", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("topic", id));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStorage for PostgresStorage {
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        let id = generate_id();
        let tags = Value::from(message.tags);
        let sql = format!(
            "INSERT INTO pl_messages (id, topic_id, title, message, priority, tags, click_url, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {MESSAGE_COLS}"
        );
        let row: MessageRow = query_as(&sql)
            .bind(&id)
            .bind(&message.topic_id)
            .bind(&message.title)
            .bind(&message.message)
            .bind(message.priority.as_str())
            .bind(&tags)
            .bind(&message.click_url)
            .bind(&message.metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| internal("Failed to store message", e))?;
        Ok(message_from_row(row))
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StorageError> {
        let sql = format!("SELECT {MESSAGE_COLS} FROM pl_messages WHERE id = $1");
        let row: Option<MessageRow> = query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("Failed to load message", e))?;
        Ok(row.map(message_from_row))
    }

    async fn list_recent(
        &self,
        topic_id: &str,
        since: Option<OffsetDateTime>,
        limit: u32,
    ) -> Result<Vec<Message>, StorageError> {
        let sql = format!(
            "SELECT {MESSAGE_COLS} FROM pl_messages
             WHERE topic_id = $1 AND ($2::timestamptz IS NULL OR created_at > $2)
             ORDER BY created_at DESC
             LIMIT $3"
        );
        let rows: Vec<MessageRow> = query_as(&sql)
            .bind(topic_id)
            .bind(since.map(time_to_chrono))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("Failed to list messages", e))?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }
}

type SubscriberRow = (String, String, String, String, bool, DateTime<Utc>, bool);

fn subscriber_from_row(row: SubscriberRow) -> Result<(Subscriber, bool), StorageError> {
    Ok((
        Subscriber {
            id: row.0,
            topic_id: row.1,
            endpoint: row.2,
            channel: parse_channel(&row.3)?,
            active: row.4,
            created_at: chrono_to_time(row.5),
        },
        row.6,
    ))
}

#[async_trait]
impl SubscriberStorage for PostgresStorage {
    async fn upsert_subscriber(
        &self,
        sub: NewSubscriber,
    ) -> Result<(Subscriber, bool), StorageError> {
        let id = generate_id();
        // xmax <> 0 distinguishes an update from a fresh insert.
        let row: SubscriberRow = query_as(
            "INSERT INTO pl_subscribers (id, topic_id, endpoint, channel)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (topic_id, endpoint)
             DO UPDATE SET active = TRUE, channel = EXCLUDED.channel
             RETURNING id, topic_id, endpoint, channel, active, created_at, (xmax <> 0)",
        )
        .bind(&id)
        .bind(&sub.topic_id)
        .bind(&sub.endpoint)
        .bind(sub.channel.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| internal("Failed to upsert subscriber", e))?;
        subscriber_from_row(row)
    }

    async fn list_subscribers(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError> {
        let rows: Vec<SubscriberRow> = query_as(
            "SELECT id, topic_id, endpoint, channel, active, created_at, FALSE
             FROM pl_subscribers WHERE topic_id = $1 ORDER BY created_at DESC",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| internal("Failed to list subscribers", e))?;
        rows.into_iter()
            .map(|r| subscriber_from_row(r).map(|(s, _)| s))
            .collect()
    }

    async fn list_active(&self, topic_id: &str) -> Result<Vec<Subscriber>, StorageError> {
        let rows: Vec<SubscriberRow> = query_as(
            "SELECT id, topic_id, endpoint, channel, active, created_at, FALSE
             FROM pl_subscribers WHERE topic_id = $1 AND active",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| internal("Failed to list active subscribers", e))?;
        rows.into_iter()
            .map(|r| subscriber_from_row(r).map(|(s, _)| s))
            .collect()
    }

    async fn deactivate_subscriber(&self, id: &str) -> Result<(), StorageError> {
        let result = query("UPDATE pl_subscribers SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| internal("Failed to deactivate subscriber", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("subscriber", id));
        }
        Ok(())
    }

    async fn delete_subscriber(&self, id: &str) -> Result<(), StorageError> {
        let result = query("DELETE FROM pl_subscribers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| internal("Failed to delete subscriber", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("subscriber", id));
        }
        Ok(())
    }
}

type AccountRow = (String, String, i64, DateTime<Utc>);

fn account_from_row(row: AccountRow) -> Account {
    Account {
        user_id: row.0,
        plan: parse_plan(&row.1),
        pushes_used: row.2,
        pushes_reset_at: chrono_to_time(row.3),
    }
}

#[async_trait]
impl AccountStorage for PostgresStorage {
    async fn get_or_create_account(&self, user_id: &str) -> Result<Account, StorageError> {
        let reset = time_to_chrono(next_month_start(OffsetDateTime::now_utc()));
        let row: AccountRow = query_as(
            "INSERT INTO pl_accounts (user_id, pushes_reset_at)
             VALUES ($1, $2)
             ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
             RETURNING user_id, plan, pushes_used, pushes_reset_at",
        )
        .bind(user_id)
        .bind(reset)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| internal("Failed to get or create account", e))?;
        Ok(account_from_row(row))
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StorageError> {
        let row: Option<AccountRow> = query_as(
            "SELECT user_id, plan, pushes_used, pushes_reset_at FROM pl_accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("Failed to load account", e))?;
        Ok(row.map(account_from_row))
    }

    async fn reset_usage(
        &self,
        user_id: &str,
        next_reset: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let result = query(
            "UPDATE pl_accounts SET pushes_used = 0, pushes_reset_at = $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(time_to_chrono(next_reset))
        .execute(&self.pool)
        .await
        .map_err(|e| internal("Failed to reset usage", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("account", user_id));
        }
        Ok(())
    }

    async fn try_consume_push(
        &self,
        user_id: &str,
        plan: Plan,
        limit: i64,
    ) -> Result<QuotaDecision, StorageError> {
        // Atomic conditional increment; a zero-row update is a rejection.
        let used: Option<i64> = query_scalar(
            "UPDATE pl_accounts SET pushes_used = pushes_used + 1
             WHERE user_id = $1 AND pushes_used < $2
             RETURNING pushes_used",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("Failed to consume push quota", e))?;

        match used {
            Some(used) => Ok(QuotaDecision::Admitted { used }),
            None => {
                let used: Option<i64> =
                    query_scalar("SELECT pushes_used FROM pl_accounts WHERE user_id = $1")
                        .bind(user_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| internal("Failed to load quota usage", e))?;
                let used = used.ok_or_else(|| StorageError::not_found("account", user_id))?;
                Ok(QuotaDecision::Exceeded { plan, used, limit })
            }
        }
    }

    async fn set_plan(&self, user_id: &str, plan: Plan) -> Result<(), StorageError> {
        let result = query("UPDATE pl_accounts SET plan = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(plan.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| internal("Failed to set plan", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("account", user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStorage for PostgresStorage {
    async fn increment(&self, key: &str, window_ms: i64) -> Result<RateLimitWindow, StorageError> {
        let window_secs = window_ms as f64 / 1000.0;
        // One statement: expired windows restart, live windows increment.
        let row: (i64, DateTime<Utc>, DateTime<Utc>) = query_as(
            "INSERT INTO pl_rate_limits (key, count, reset_at)
             VALUES ($1, 1, NOW() + make_interval(secs => $2))
             ON CONFLICT (key) DO UPDATE SET
                 count = CASE WHEN pl_rate_limits.reset_at <= NOW()
                              THEN 1 ELSE pl_rate_limits.count + 1 END,
                 reset_at = CASE WHEN pl_rate_limits.reset_at <= NOW()
                                 THEN NOW() + make_interval(secs => $2)
                                 ELSE pl_rate_limits.reset_at END
             RETURNING count, reset_at, NOW()",
        )
        .bind(key)
        .bind(window_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| internal("Failed to increment rate limit", e))?;

        let reset_in_ms = (row.1 - row.2).num_milliseconds().max(0);
        Ok(RateLimitWindow {
            count: row.0,
            reset_in_ms,
        })
    }
}

#[async_trait]
impl DeliveryAttemptStorage for PostgresStorage {
    async fn record_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Result<DeliveryAttempt, StorageError> {
        let id = generate_id();
        let sql = format!(
            "INSERT INTO pl_delivery_attempts (id, message_id, subscriber_id, channel, endpoint)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {ATTEMPT_COLS}"
        );
        let row: AttemptRow = query_as(&sql)
            .bind(&id)
            .bind(&attempt.message_id)
            .bind(&attempt.subscriber_id)
            .bind(attempt.channel.as_str())
            .bind(&attempt.endpoint)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| internal("Failed to record delivery attempt", e))?;
        attempt_from_row(row)
    }

    async fn mark_delivered(&self, id: &str) -> Result<(), StorageError> {
        let result = query(
            "UPDATE pl_delivery_attempts
             SET status = 'delivered', attempts = attempts + 1,
                 next_attempt_at = NULL, last_error = NULL
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| internal("Failed to mark attempt delivered", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("delivery attempt", id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<(), StorageError> {
        let result = query(
            "UPDATE pl_delivery_attempts
             SET status = 'failed', attempts = attempts + 1,
                 next_attempt_at = $2, last_error = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(next_attempt_at.map(time_to_chrono))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| internal("Failed to mark attempt failed", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("delivery attempt", id));
        }
        Ok(())
    }

    async fn claim_due(&self, limit: u32) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let sql = format!(
            "UPDATE pl_delivery_attempts SET next_attempt_at = NULL
             WHERE id IN (
                 SELECT id FROM pl_delivery_attempts
                 WHERE status = 'failed' AND next_attempt_at IS NOT NULL
                   AND next_attempt_at <= NOW()
                 ORDER BY next_attempt_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {ATTEMPT_COLS}"
        );
        let rows: Vec<AttemptRow> = query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("Failed to claim due attempts", e))?;
        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn counts_for_message(&self, message_id: &str) -> Result<AttemptCounts, StorageError> {
        let rows: Vec<(String, i64)> = query_as(
            "SELECT status, COUNT(*) FROM pl_delivery_attempts
             WHERE message_id = $1 GROUP BY status",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| internal("Failed to count attempts", e))?;
        let mut counts = AttemptCounts::default();
        for (status, n) in rows {
            let n = n.max(0) as u32;
            match parse_status(&status)? {
                DeliveryStatus::Pending => counts.pending = n,
                DeliveryStatus::Delivered => counts.delivered = n,
                DeliveryStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

impl Storage for PostgresStorage {
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
        "postgres"
    }
}
