//! Schema bootstrap: creates the Pushline tables and indexes if absent.

use sqlx_core::query::query;
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::Result;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pl_accounts (
        user_id TEXT PRIMARY KEY,
        plan TEXT NOT NULL DEFAULT 'free',
        pushes_used BIGINT NOT NULL DEFAULT 0,
        pushes_reset_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pl_topics (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        is_private BOOLEAN NOT NULL DEFAULT FALSE,
        api_key TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pl_messages (
        id TEXT PRIMARY KEY,
        topic_id TEXT NOT NULL REFERENCES pl_topics(id) ON DELETE CASCADE,
        title TEXT,
        message TEXT NOT NULL,
        priority TEXT NOT NULL DEFAULT 'normal',
        tags JSONB NOT NULL DEFAULT '[]',
        click_url TEXT,
        metadata JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pl_subscribers (
        id TEXT PRIMARY KEY,
        topic_id TEXT NOT NULL REFERENCES pl_topics(id) ON DELETE CASCADE,
        endpoint TEXT NOT NULL,
        channel TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (topic_id, endpoint)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pl_rate_limits (
        key TEXT PRIMARY KEY,
        count BIGINT NOT NULL DEFAULT 0,
        reset_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pl_delivery_attempts (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL REFERENCES pl_messages(id) ON DELETE CASCADE,
        subscriber_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_topic_created ON pl_messages(topic_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_subscribers_topic_active ON pl_subscribers(topic_id) WHERE active",
    "CREATE INDEX IF NOT EXISTS idx_attempts_due ON pl_delivery_attempts(next_attempt_at) WHERE next_attempt_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_topics_owner ON pl_topics(user_id)",
];

/// Creates all tables and indexes. Idempotent.
#[instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for ddl in TABLES {
        query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        query(ddl).execute(pool).await?;
    }
    info!("Pushline schema ready");
    Ok(())
}
