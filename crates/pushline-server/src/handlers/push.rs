//! The push pipeline: `POST/PUT /push/{topic}` and the history read.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use pushline_core::NewMessage;

use crate::error::ApiError;
use crate::guard::{authorize, bearer_token, resolve_topic};
use crate::ingest::{HeaderParams, build_draft, parse_body};
use crate::quota;
use crate::rate_limit::{self, client_ip};
use crate::server::AppState;

const HISTORY_MAX_LIMIT: u32 = 50;
const HISTORY_DEFAULT_LIMIT: u32 = 10;

/// Rate limit → resolve/authorize → parse → quota → persist → fan out.
/// Nothing is persisted for any rejected push.
pub async fn publish(
    State(state): State<AppState>,
    Path(topic_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    rate_limit::check(
        &state.storage,
        "push",
        &client_ip(&headers),
        state.rate_limit.push_per_window,
        state.rate_limit.window_ms,
    )
    .await?;

    let topic = resolve_topic(&state.storage, &topic_name).await?;
    authorize(&topic, bearer_token(&headers).as_deref())?;

    // Validation runs before the quota increment so a rejected push never
    // consumes a unit.
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let draft = build_draft(
        parse_body(content_type, &body),
        &HeaderParams::from_headers(&headers),
    )?;

    quota::check_and_consume(&state.storage, &state.plans, &topic.user_id).await?;

    let message = state
        .storage
        .messages()
        .insert_message(NewMessage {
            topic_id: topic.id.clone(),
            title: draft.title,
            message: draft.message,
            priority: draft.priority,
            tags: draft.tags,
            click_url: draft.click_url,
            metadata: None,
        })
        .await?;

    let summary = state.dispatcher.dispatch(&topic, &message).await?;

    tracing::info!(
        topic = %topic.name,
        message_id = %message.id,
        subscribers = summary.subscriber_count,
        "Push delivered"
    );

    Ok(Json(json!({
        "success": true,
        "id": message.id,
        "topic": topic.name,
        "timestamp": message.created_at.format(&Rfc3339).unwrap_or_default(),
        "subscribers": summary.subscriber_count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Recent messages for a topic, newest first. Same credential check as
/// publishing.
pub async fn history(
    State(state): State<AppState>,
    Path(topic_name): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let topic = resolve_topic(&state.storage, &topic_name).await?;
    authorize(&topic, bearer_token(&headers).as_deref())?;

    let since = query
        .since
        .as_deref()
        .map(|s| {
            OffsetDateTime::parse(s, &Rfc3339)
                .map_err(|_| ApiError::Validation(format!("Invalid 'since' timestamp: {s}")))
        })
        .transpose()?;
    let limit = query
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .min(HISTORY_MAX_LIMIT);

    let messages = state
        .storage
        .messages()
        .list_recent(&topic.id, since, limit)
        .await?;

    Ok(Json(json!({
        "topic": topic.name,
        "count": messages.len(),
        "messages": messages,
    })))
}
