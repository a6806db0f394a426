//! Topic resolution and access control for the push paths.

use axum::http::HeaderMap;

use pushline_core::Topic;
use pushline_storage::DynStorage;

use crate::error::ApiError;

/// The bearer token from an `Authorization` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Look the topic up by name; unknown names are 404 regardless of privacy,
/// so probing cannot distinguish missing from private.
pub async fn resolve_topic(storage: &DynStorage, name: &str) -> Result<Topic, ApiError> {
    storage
        .topics()
        .find_by_name(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Topic '{name}' not found")))
}

/// Private topics require the bearer token to equal the topic's api_key.
/// Runs before quota consumption and persistence.
pub fn authorize(topic: &Topic, bearer: Option<&str>) -> Result<(), ApiError> {
    if !topic.is_private {
        return Ok(());
    }
    match bearer {
        Some(token) if token == topic.api_key => Ok(()),
        _ => Err(ApiError::Unauthorized(
            "Invalid or missing API key for private topic".into(),
        )),
    }
}

/// Pushover-compatible resolution: `token` is required and tried as an
/// api_key first, then `user` as a public topic name. A token match
/// authorizes private topics by construction.
pub async fn resolve_pushover(
    storage: &DynStorage,
    token: &str,
    user: Option<&str>,
) -> Result<Topic, ApiError> {
    if let Some(topic) = storage.topics().find_by_api_key(token).await? {
        return Ok(topic);
    }
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        if let Some(topic) = storage.topics().find_public_by_name(user).await? {
            return Ok(topic);
        }
    }
    Err(ApiError::Unauthorized(
        "No topic matches the supplied token or user".into(),
    ))
}
