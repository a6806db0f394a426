//! Inbound push parsing: body, headers, and their precedence.
//!
//! Pure functions, no I/O. The push handler resolves the raw request into a
//! [`ParsedBody`] exactly once, extracts [`HeaderParams`], and [`build_draft`]
//! merges them with header-over-body precedence.

use axum::http::HeaderMap;
use serde_json::{Map, Value};

use pushline_core::Priority;

use crate::error::ApiError;

/// The request body, resolved once from the content type.
#[derive(Debug)]
pub enum ParsedBody {
    /// Raw text, used verbatim as the message.
    Text(String),
    /// A JSON object; `message` and the optional fields come from its keys.
    Json(Map<String, Value>),
}

/// Resolve the body from content type. A JSON content type with a non-object
/// or unparseable payload falls back to raw text.
pub fn parse_body(content_type: Option<&str>, body: &[u8]) -> ParsedBody {
    let text = String::from_utf8_lossy(body).into_owned();
    let is_json = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false);
    if is_json {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) {
            return ParsedBody::Json(map);
        }
    }
    ParsedBody::Text(text)
}

/// Per-message parameters carried in request headers. Each accepts a plain
/// and an `X-` prefixed form.
#[derive(Debug, Default)]
pub struct HeaderParams {
    pub title: Option<String>,
    pub priority: Option<String>,
    pub tags: Option<String>,
    pub click: Option<String>,
}

impl HeaderParams {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str, alt: &str| {
            headers
                .get(name)
                .or_else(|| headers.get(alt))
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            title: get("title", "x-title"),
            priority: get("priority", "x-priority"),
            tags: get("tags", "x-tags"),
            click: get("click", "x-click"),
        }
    }
}

/// A validated message, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub title: Option<String>,
    pub message: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub click_url: Option<String>,
}

/// Merge body and headers into a draft. Headers win over JSON fields; both
/// win over defaults. The trimmed message must be non-empty.
pub fn build_draft(parsed: ParsedBody, headers: &HeaderParams) -> Result<MessageDraft, ApiError> {
    let (message, json_title, json_priority, json_tags, json_click) = match parsed {
        ParsedBody::Text(text) => (text, None, None, None, None),
        ParsedBody::Json(map) => {
            let message = match map.get("message").and_then(Value::as_str) {
                Some(m) => m.to_owned(),
                // No message field: the whole object is the message.
                None => Value::Object(map.clone()).to_string(),
            };
            let title = map.get("title").and_then(Value::as_str).map(str::to_owned);
            let priority = map
                .get("priority")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let tags = map.get("tags").map(|v| match v {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.as_str().unwrap_or_default().to_owned(),
            });
            let click = map.get("click").and_then(Value::as_str).map(str::to_owned);
            (message, title, priority, tags, click)
        }
    };

    let message = message.trim().to_owned();
    if message.is_empty() {
        return Err(ApiError::Validation("Message must not be empty".into()));
    }

    let priority = headers
        .priority
        .as_deref()
        .or(json_priority.as_deref())
        .map(Priority::parse_or_normal)
        .unwrap_or_default();

    let tags = headers
        .tags
        .as_deref()
        .or(json_tags.as_deref())
        .map(split_tags)
        .unwrap_or_default();

    Ok(MessageDraft {
        title: headers.title.clone().or(json_title),
        message,
        priority,
        tags,
        click_url: headers.click.clone().or(json_click),
    })
}

/// Comma-separated tags, individually trimmed, empties dropped.
fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
