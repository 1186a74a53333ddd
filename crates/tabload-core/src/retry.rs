//! Bounded exponential-backoff retry for storage and database round-trips.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LoadError;

/// Retry budget: attempts, initial delay, delay multiplier.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

/// Run `op` up to `policy.attempts` times with exponential backoff.
///
/// File-notifiable errors propagate immediately; retrying them could only
/// repeat the same verdict on the same file.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T, LoadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LoadError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_notifiable() => return Err(err),
            Err(err) if attempt >= policy.attempts => return Err(err),
            Err(err) => {
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    attempts = policy.attempts,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.multiplier);
                attempt += 1;
            }
        }
    }
}
