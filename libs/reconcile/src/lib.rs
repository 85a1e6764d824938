//! Reconciliation loop primitives.
//!
//! Helpers shared by everything that drives cluster state towards a desired
//! shape one cycle at a time:
//!
//! - [`BackoffPolicy`]: randomized exponential delays between attempts.
//! - [`Attempt`] and [`retry_until`]: an explicit "try again" outcome that is
//!   kept apart from real failures, plus a deadline-bounded retry loop.
//! - [`DelayedErrorHandler`]: swallow an error until it has persisted for a
//!   tolerance window.
//!
//! # Invariants
//!
//! - A `TryAgain` outcome never escapes `retry_until` as a failure before the
//!   deadline is reached.
//! - `Failed` outcomes are returned immediately and never retried.

mod backoff;
mod delayed;
mod retry;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use delayed::DelayedErrorHandler;
pub use retry::{retry_until, Attempt, RetryError};

/// Default period of the scheduler ticker.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default bounded wait when cancelling an in-flight reconciliation.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window during which transient sidecar errors are tolerated.
pub const DEFAULT_ERROR_TOLERANCE: Duration = Duration::from_secs(20);
