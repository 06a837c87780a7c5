//! Retry policy driver and deadline checks shared by queries and batches.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::Error;
use crate::config::RetryConfig;

/// Calculate retry delay with exponential backoff
///
/// # Arguments
/// * `attempt` - The retry attempt number (0-based)
/// * `initial` - Initial delay duration
/// * `max` - Maximum delay duration
pub(crate) fn retry_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
    let factor = 2u64.checked_pow(attempt as u32).unwrap_or(u64::MAX);
    let delay_ms = (initial.as_millis() as u64).saturating_mul(factor);
    let capped_delay = delay_ms.min(max.as_millis() as u64);
    Duration::from_millis(capped_delay)
}

/// Fail with [`Error::Timeout`] when `deadline` has already passed
///
/// Called before every network call; an in-flight call is never cancelled.
pub(crate) fn check_deadline(
    deadline: Option<Instant>,
    operation: &'static str,
    attempts: usize,
) -> Result<(), Error> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            warn!(operation, attempts, "deadline elapsed, not sending request");
            Err(Error::Timeout {
                operation,
                attempts,
            })
        }
        _ => Ok(()),
    }
}

/// Run `attempt` under `policy`.
///
/// Transport faults are retried; so are empty results when `retry_on_empty`
/// is set and `is_empty` says so. Any other error is returned immediately, and
/// once the budget is spent the last fault is returned unchanged.
pub(crate) async fn run<T, F, Fut>(
    policy: &RetryConfig,
    deadline: Option<Instant>,
    operation: &'static str,
    is_empty: impl Fn(&T) -> bool,
    mut attempt: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retry_count = 0;

    loop {
        check_deadline(deadline, operation, retry_count)?;

        let outcome = attempt().await;
        let exhausted = retry_count >= policy.max_retries;

        match outcome {
            Ok(value) if policy.retry_on_empty && !exhausted && is_empty(&value) => {
                debug!(operation, retry_count, "empty result, retrying");
            }
            Err(Error::Transport(e)) if !exhausted => {
                warn!(operation, retry_count, error = %e, "transport error, retrying");
            }
            outcome => return outcome,
        }

        sleep(retry_delay(
            retry_count,
            policy.initial_delay,
            policy.max_delay,
        ))
        .await;
        retry_count += 1;
    }
}
