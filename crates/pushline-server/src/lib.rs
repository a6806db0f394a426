//! # pushline-server
//!
//! The HTTP surface of the Pushline notification service: configuration,
//! observability, the push and Pushover-compatible ingestion paths, topic
//! and subscriber management, and the server runtime.

pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod ingest;
pub mod observability;
pub mod quota;
pub mod rate_limit;
pub mod server;

pub use config::AppConfig;
pub use error::ApiError;
pub use server::{AppState, PushlineServer, ServerBuilder, build_app};
