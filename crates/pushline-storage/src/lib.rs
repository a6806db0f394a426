//! # pushline-storage
//!
//! Storage abstraction layer for the Pushline notification service.
//!
//! This crate defines the traits every storage backend must implement, the
//! shared [`StorageError`] type, and a DashMap-backed [`MemoryStorage`] used
//! by tests and local development. The production backend lives in
//! `pushline-db-postgres`.
//!
//! Two counters carry correctness requirements under concurrency and must be
//! atomic at the storage layer, never read-modify-write in a handler:
//!
//! - [`AccountStorage::try_consume_push`] — the monthly quota counter
//! - [`RateLimitStorage::increment`] — the per-client rate-limit window

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use traits::{
    AccountStorage, DeliveryAttemptStorage, DynStorage, MessageStorage, RateLimitStorage,
    Storage, SubscriberStorage, TopicStorage,
};
pub use types::{AttemptCounts, QuotaDecision, RateLimitWindow};
