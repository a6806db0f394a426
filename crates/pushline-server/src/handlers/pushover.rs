//! Pushover-compatible ingestion: `POST /pushover` and `POST /1/messages.json`.
//!
//! Accepts form-encoded, multipart, and JSON bodies; unknown content types
//! get a best-effort urlencoded parse. Responses use the Pushover envelope
//! (`{status: 1, request}` / `{status: 0, errors: [...]}`) instead of the
//! native error shape.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use pushline_core::{NewMessage, Plan, Priority};

use crate::error::ApiError;
use crate::guard::resolve_pushover;
use crate::quota;
use crate::rate_limit::{self, client_ip};
use crate::server::AppState;

/// Suffix appended to free-plan messages on this path.
const FREE_TIER_SUFFIX: &str = " • via pushline";

/// Fields stored verbatim as message metadata.
const PASSTHROUGH_FIELDS: &[&str] = &["sound", "device", "timestamp", "url_title"];

/// Fields stored as `true` when the client sends `"1"`, omitted otherwise.
const FLAG_FIELDS: &[&str] = &["html", "monospace"];

pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    match handle(state, &headers, request).await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status();
            (status, Json(json!({ "status": 0, "errors": [e.to_string()] }))).into_response()
        }
    }
}

/// Informational payload describing the compatible surface.
pub async fn info() -> impl IntoResponse {
    Json(json!({
        "service": "Pushline",
        "compatible_with": "Pushover message API",
        "endpoint": "/1/messages.json",
        "method": "POST",
        "fields": {
            "token": "topic api key",
            "user": "public topic name (fallback when token does not match)",
            "message": "required",
            "title": "optional",
            "url": "optional click-through link",
            "priority": "-2..2",
        },
    }))
}

async fn handle(
    state: AppState,
    headers: &HeaderMap,
    request: Request,
) -> Result<Response, ApiError> {
    rate_limit::check(
        &state.storage,
        "pushover",
        &client_ip(headers),
        state.rate_limit.pushover_per_window,
        state.rate_limit.window_ms,
    )
    .await?;

    let params = parse_params(headers, request).await?;

    let token = params
        .get("token")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Validation("token parameter is required".into()))?;

    let message_text = params
        .get("message")
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::Validation("message cannot be blank".into()))?
        .to_owned();

    let topic = resolve_pushover(
        &state.storage,
        token,
        params.get("user").map(String::as_str),
    )
    .await?;

    quota::check_and_consume(&state.storage, &state.plans, &topic.user_id).await?;

    let priority = params
        .get("priority")
        .and_then(|p| p.trim().parse::<i64>().ok())
        .map(Priority::from_pushover)
        .unwrap_or_default();

    let account = state
        .storage
        .accounts()
        .get_or_create_account(&topic.user_id)
        .await?;
    let message_text = if account.plan == Plan::Free {
        format!("{message_text}{FREE_TIER_SUFFIX}")
    } else {
        message_text
    };

    let metadata = collect_metadata(&params);

    let message = state
        .storage
        .messages()
        .insert_message(NewMessage {
            topic_id: topic.id.clone(),
            title: params.get("title").filter(|t| !t.is_empty()).cloned(),
            message: message_text,
            priority,
            tags: Vec::new(),
            click_url: params.get("url").filter(|u| !u.is_empty()).cloned(),
            metadata,
        })
        .await?;

    let summary = state.dispatcher.dispatch(&topic, &message).await?;

    tracing::info!(
        topic = %topic.name,
        message_id = %message.id,
        subscribers = summary.subscriber_count,
        "Pushover-compatible push delivered"
    );

    Ok((
        StatusCode::OK,
        Json(json!({ "status": 1, "request": message.id })),
    )
        .into_response())
}

/// Resolve the request into flat string fields, whatever the content type.
async fn parse_params(
    headers: &HeaderMap,
    request: Request,
) -> Result<HashMap<String, String>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();
    let mime = content_type.split(';').next().unwrap_or("").trim();

    if mime == "multipart/form-data" {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::Validation(format!("Invalid multipart body: {e}")))?;
        let mut params = HashMap::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::Validation(format!("Invalid multipart body: {e}")))?
        {
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::Validation(format!("Invalid multipart field: {e}")))?;
            params.insert(name, value);
        }
        return Ok(params);
    }

    let bytes = axum::body::Bytes::from_request(request, &())
        .await
        .map_err(|e| ApiError::Validation(format!("Unreadable body: {e}")))?;

    if mime == "application/json" {
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Validation(format!("Invalid JSON body: {e}")))?;
        let Value::Object(map) = value else {
            return Err(ApiError::Validation("JSON body must be an object".into()));
        };
        return Ok(map
            .into_iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect());
    }

    // Form-encoded, or a best-effort urlencoded parse for everything else.
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&bytes)
        .map_err(|e| ApiError::Validation(format!("Invalid form body: {e}")))?;
    Ok(pairs.into_iter().collect())
}

fn collect_metadata(params: &HashMap<String, String>) -> Option<Value> {
    let mut map = serde_json::Map::new();
    for field in PASSTHROUGH_FIELDS {
        if let Some(value) = params.get(*field).filter(|v| !v.is_empty()) {
            map.insert((*field).to_owned(), Value::String(value.clone()));
        }
    }
    for field in FLAG_FIELDS {
        if params.get(*field).is_some_and(|v| v == "1") {
            map.insert((*field).to_owned(), Value::Bool(true));
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}
