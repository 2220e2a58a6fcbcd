//! PostgreSQL persistence.
//!
//! - `pool`: connection pool sizing and creation
//! - `retry`: backoff for transient failures
//! - `schema`: idempotent table bootstrap
//! - `store`: [`PgStore`], the database-backed store and providers

pub mod pool;
pub mod retry;
pub mod schema;
pub mod store;

pub use pool::{create_pool, DbPoolConfig};
pub use retry::{execute_with_retry, is_retriable_error, RetryPolicy};
pub use store::PgStore;
