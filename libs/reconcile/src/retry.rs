use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::BackoffPolicy;

/// Outcome of one attempt inside [`retry_until`].
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The operation completed.
    Ready(T),

    /// Not there yet; try again after a backoff delay.
    TryAgain(String),

    /// A real failure; stop retrying.
    Failed(E),
}

/// Error returned by [`retry_until`].
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    /// The deadline passed while the operation kept asking to be retried.
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last_reason}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last_reason: String,
    },

    /// The operation reported a non-retryable failure.
    #[error("{0}")]
    Failed(E),
}

impl<E: fmt::Display> RetryError<E> {
    /// Returns true if the deadline was reached.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Run `op` until it is ready, fails, or `deadline` elapses.
///
/// The closure receives the 0-based attempt number. The loop never sleeps past
/// the deadline: if the next backoff would cross it, `Exhausted` is returned
/// straight away.
pub async fn retry_until<T, E, F, Fut>(
    policy: &BackoffPolicy,
    deadline: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        let last_reason = match op(attempt).await {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Failed(err) => return Err(RetryError::Failed(err)),
            Attempt::TryAgain(reason) => reason,
        };

        let delay = policy.delay(attempt);
        let elapsed = started.elapsed();
        if elapsed + delay > deadline {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                elapsed,
                last_reason,
            });
        }

        debug!(attempt, delay_ms = delay.as_millis() as u64, reason = %last_reason, "Retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
