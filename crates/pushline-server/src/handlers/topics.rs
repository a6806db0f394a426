//! Topic management. Owner identity arrives from the external auth layer in
//! `X-User-Id`; this service treats it as an opaque, trusted id.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use pushline_core::sanitize_topic_name;

use crate::error::ApiError;
use crate::server::AppState;

/// The owner id from `X-User-Id`. The management API is unreachable without
/// it.
pub fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::Unauthorized("Missing X-User-Id header".into()))
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let topics = state.storage.topics().list_by_owner(&user).await?;
    Ok(Json(json!({ "count": topics.len(), "topics": topics })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTopicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;

    let name = sanitize_topic_name(&request.name).ok_or_else(|| {
        ApiError::Validation(format!("'{}' is not a usable topic name", request.name))
    })?;

    let account = state.storage.accounts().get_or_create_account(&user).await?;
    let limits = state.plans.limits(account.plan);

    if request.is_private && !limits.private_topics {
        return Err(ApiError::Forbidden(format!(
            "Private topics are not available on the {} plan",
            account.plan
        )));
    }
    if let Some(max_topics) = limits.topics {
        let owned = state.storage.topics().count_by_owner(&user).await?;
        if owned >= max_topics {
            return Err(ApiError::Forbidden(format!(
                "Topic limit reached for the {} plan ({owned}/{max_topics})",
                account.plan
            )));
        }
    }

    let topic = state
        .storage
        .topics()
        .create_topic(&name, &user, request.is_private)
        .await?;

    tracing::info!(topic = %topic.name, user_id = %user, private = topic.is_private, "Topic created");

    Ok((StatusCode::CREATED, Json(topic)))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(topic_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let topic = owned_topic(&state, &user, &topic_id).await?;

    state.storage.topics().delete_topic(&topic.id).await?;
    tracing::info!(topic = %topic.name, user_id = %user, "Topic deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// Topic lookup scoped to the owner. Someone else's topic is a 404, not a
/// 403, so ids cannot be probed.
pub async fn owned_topic(
    state: &AppState,
    user: &str,
    topic_id: &str,
) -> Result<pushline_core::Topic, ApiError> {
    state
        .storage
        .topics()
        .find_by_id(topic_id)
        .await?
        .filter(|t| t.user_id == user)
        .ok_or_else(|| ApiError::NotFound(format!("Topic '{topic_id}' not found")))
}
