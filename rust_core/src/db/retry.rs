//! Retry with exponential backoff for transient database failures

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// SQLSTATE codes worth retrying: serialization failure, deadlock,
/// too many connections, admin/crash shutdown
const RETRIABLE_SQLSTATES: &[&str] = &["40001", "40P01", "53300", "57P01", "57P02", "57P03"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        Duration::from_millis(exp.min(self.max_backoff_ms))
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
///
/// `f` must be safe to repeat: each call opens its own transaction.
pub async fn execute_with_retry<F, Fut, T>(policy: RetryPolicy, what: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_attempts && is_retriable_error(&e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms",
                    what,
                    attempt,
                    policy.max_attempts,
                    e,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether an error looks transient
pub fn is_retriable_error(e: &anyhow::Error) -> bool {
    if let Some(db_err) = e.downcast_ref::<sqlx::Error>() {
        return match db_err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
            sqlx::Error::Database(inner) => inner
                .code()
                .map(|code| RETRIABLE_SQLSTATES.contains(&code.as_ref()))
                .unwrap_or(false),
            _ => false,
        };
    }

    let err_str = e.to_string().to_lowercase();
    err_str.contains("connection reset")
        || err_str.contains("connection refused")
        || err_str.contains("connection closed")
        || err_str.contains("broken pipe")
        || err_str.contains("timeout")
        || err_str.contains("could not serialize")
        || err_str.contains("deadlock detected")
        || err_str.contains("too many clients")
}
