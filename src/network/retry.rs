//! Bounded exponential-backoff retry
//!
//! A convenience layer above the single-retry token-refresh mechanism,
//! intended for transient-network-error recovery rather than auth recovery.

use std::time::Duration;

use tracing::info;

use crate::error::{ExecutorError, Result};

/// Longest wait between two attempts.
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Wait before the attempt following attempt `attempt`: `min(2^attempt, 10)`
/// seconds.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let seconds = 2u64
        .saturating_pow(attempt)
        .min(BACKOFF_CAP.as_secs());
    Duration::from_secs(seconds)
}

/// Runs `operation` up to `max_attempts` times with exponential backoff in
/// between. Terminal errors are raised immediately; after the attempts are
/// exhausted the last observed error is raised.
pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_terminal_for_retry() => return Err(error),
            Err(error) => {
                last_error = Some(error);
                if attempt + 1 < max_attempts {
                    let delay = backoff_for_attempt(attempt);
                    info!(
                        attempt = attempt + 2,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        "Retrying network request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ExecutorError::Transport("retry loop finished without an attempt".into())
    }))
}
