//! Subscriber management under `/topics/{id}/subscribers`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use pushline_core::{ChannelType, NewSubscriber};

use crate::error::ApiError;
use crate::handlers::topics::{owned_topic, user_id};
use crate::server::AppState;

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(topic_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let topic = owned_topic(&state, &user, &topic_id).await?;

    let subscribers = state.storage.subscribers().list_subscribers(&topic.id).await?;
    Ok(Json(json!({
        "count": subscribers.len(),
        "subscribers": subscribers,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AddSubscriberRequest {
    pub endpoint: String,
    #[serde(rename = "type")]
    pub channel: String,
}

/// Adds a subscriber, or reactivates the existing one for the same
/// (topic, endpoint) pair.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(topic_id): Path<String>,
    Json(request): Json<AddSubscriberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let topic = owned_topic(&state, &user, &topic_id).await?;

    let endpoint = request.endpoint.trim();
    if endpoint.is_empty() {
        return Err(ApiError::Validation("endpoint must not be empty".into()));
    }
    let channel = ChannelType::parse(&request.channel).ok_or_else(|| {
        ApiError::Validation(format!(
            "'{}' is not a valid subscriber type (webhook, email, expo_push)",
            request.channel
        ))
    })?;

    let account = state.storage.accounts().get_or_create_account(&user).await?;
    if channel == ChannelType::Webhook && !state.plans.limits(account.plan).webhooks {
        return Err(ApiError::Forbidden(format!(
            "Webhook subscribers are not available on the {} plan",
            account.plan
        )));
    }

    let (subscriber, updated) = state
        .storage
        .subscribers()
        .upsert_subscriber(NewSubscriber {
            topic_id: topic.id.clone(),
            endpoint: endpoint.to_owned(),
            channel,
        })
        .await?;

    tracing::info!(
        topic = %topic.name,
        channel = %channel.as_str(),
        reactivated = updated,
        "Subscriber added"
    );

    let status = if updated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(subscriber)))
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((topic_id, subscriber_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers)?;
    let topic = owned_topic(&state, &user, &topic_id).await?;

    // Scope the delete to this topic's subscribers.
    let belongs = state
        .storage
        .subscribers()
        .list_subscribers(&topic.id)
        .await?
        .iter()
        .any(|s| s.id == subscriber_id);
    if !belongs {
        return Err(ApiError::NotFound(format!(
            "Subscriber '{subscriber_id}' not found"
        )));
    }

    state
        .storage
        .subscribers()
        .delete_subscriber(&subscriber_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
