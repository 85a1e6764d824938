use std::time::Duration;

use tokio::time::Instant;

/// Tolerates a recurring error until it has persisted for a while.
///
/// Call [`try_to_raise`](Self::try_to_raise) on every failure and
/// [`reset`](Self::reset) on every success. The error is handed back to the
/// caller only once failures have been observed continuously for longer than
/// the tolerance window.
#[derive(Debug, Clone, Default)]
pub struct DelayedErrorHandler {
    first_error_at: Option<Instant>,
}

impl DelayedErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Err(err)` once errors have persisted longer than `tolerance`.
    pub fn try_to_raise<E>(&mut self, err: E, tolerance: Duration) -> Result<(), E> {
        let first = *self.first_error_at.get_or_insert_with(Instant::now);
        if first.elapsed() > tolerance {
            return Err(err);
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.first_error_at = None;
    }

    pub fn is_tracking(&self) -> bool {
        self.first_error_at.is_some()
    }
}
