//! # pushline-delivery
//!
//! Channel adapters (webhook, SMTP email, Expo push), the concurrent fan-out
//! [`Dispatcher`], and the background [`RetrySweeper`] that re-delivers
//! failed attempts with exponential backoff.

pub mod adapters;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod types;

pub use adapters::{AdapterSet, ChannelAdapter, EmailAdapter, ExpoPushAdapter, SmtpConfig, WebhookAdapter};
pub use dispatcher::{DEFAULT_DISPATCH_TIMEOUT, Dispatcher};
pub use error::DeliveryError;
pub use retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_SWEEP_BATCH, DEFAULT_SWEEP_INTERVAL, RetrySweeper, next_retry_at,
};
pub use types::{DispatchSummary, OutboundNotification};
