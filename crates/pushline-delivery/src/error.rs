//! Delivery error type.
//!
//! These errors never cross into the HTTP surface; the dispatcher and the
//! retry sweep absorb them into delivery-attempt records.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The subscriber endpoint cannot be used with this channel.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The delivery call itself failed (connect error, timeout, non-2xx).
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The overall dispatch deadline elapsed before the call settled.
    #[error("Delivery timed out")]
    Timeout,

    /// The channel is not configured (for example, no SMTP relay).
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeliveryError::SendFailed("connection refused".into());
        assert_eq!(err.to_string(), "Send failed: connection refused");
    }
}
