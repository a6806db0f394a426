//! PostgreSQL storage backend for Pushline.
//!
//! Implements the `pushline-storage` traits on top of a connection pool,
//! including the schema bootstrap and the atomic quota and rate-limit
//! counters.

pub mod config;
pub mod error;
pub mod pool;
pub mod schema;
pub mod storage;

pub use config::PostgresConfig;
pub use error::PostgresError;
pub use pool::create_pool;
pub use schema::ensure_schema;
pub use storage::PostgresStorage;
