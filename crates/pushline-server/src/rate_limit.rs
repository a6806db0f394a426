//! Per-client request throttling backed by shared storage.
//!
//! Counters live in the storage backend so every instance of the service
//! sees the same windows. A storage failure fails open: throttling is
//! availability protection, not an integrity boundary.

use axum::http::HeaderMap;

use pushline_storage::DynStorage;

use crate::error::ApiError;

/// Client IP from proxy headers, falling back to a shared anonymous bucket.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_owned();
        }
    }
    "anonymous".to_owned()
}

/// Count this request against `{category}:{ip}` and reject once the window
/// limit is exceeded. Runs before any other side effect.
pub async fn check(
    storage: &DynStorage,
    category: &str,
    ip: &str,
    limit: i64,
    window_ms: i64,
) -> Result<(), ApiError> {
    let key = format!("{category}:{ip}");
    match storage.rate_limits().increment(&key, window_ms).await {
        Ok(window) => {
            if window.count > limit {
                let retry_after = (window.reset_in_ms as u64).div_ceil(1000);
                return Err(ApiError::RateLimited { retry_after });
            }
            Ok(())
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pushline_storage::MemoryStorage;
    use std::sync::Arc;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_then_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("5.6.7.8"));
        assert_eq!(client_ip(&headers), "5.6.7.8");
        assert_eq!(client_ip(&HeaderMap::new()), "anonymous");
    }

    #[tokio::test]
    async fn test_blocks_after_limit_with_retry_after() {
        let storage: DynStorage = Arc::new(MemoryStorage::default());
        for _ in 0..3 {
            check(&storage, "push", "1.2.3.4", 3, 60_000).await.unwrap();
        }
        let err = check(&storage, "push", "1.2.3.4", 3, 60_000)
            .await
            .unwrap_err();
        match err {
            ApiError::RateLimited { retry_after } => assert!(retry_after <= 60),
            other => panic!("expected RateLimited, got {other:?}"),
        }
        // Another category, same IP: independent window.
        check(&storage, "pushover", "1.2.3.4", 3, 60_000)
            .await
            .unwrap();
    }
}
