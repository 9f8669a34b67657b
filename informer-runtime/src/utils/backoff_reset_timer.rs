use std::time::Duration;

use tokio::time::Instant;

use super::ResettableBackoff;

/// A [`ResettableBackoff`] wrapper that resets after a fixed duration has elapsed.
///
/// Explicit [`reset`](ResettableBackoff::reset) calls are ignored, so that a loop which
/// fails again right after a single success still backs off further.
pub struct ResetTimerBackoff<B: ResettableBackoff> {
    backoff: B,
    last_backoff: Option<Instant>,
    reset_duration: Duration,
}

impl<B: ResettableBackoff> ResetTimerBackoff<B> {
    /// Wraps `backoff`, resetting it once `reset_duration` has passed since the last delay
    pub fn new(backoff: B, reset_duration: Duration) -> Self {
        Self {
            backoff,
            last_backoff: None,
            reset_duration,
        }
    }
}

impl<B: ResettableBackoff> Iterator for ResetTimerBackoff<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(last_backoff) = self.last_backoff {
            if Instant::now() > last_backoff + self.reset_duration {
                tracing::debug!(
                    ?last_backoff,
                    reset_duration = ?self.reset_duration,
                    "Resetting backoff, since reset duration has expired"
                );
                self.backoff.reset();
            }
        }
        self.last_backoff = Some(Instant::now());
        self.backoff.next()
    }
}

impl<B: ResettableBackoff> ResettableBackoff for ResetTimerBackoff<B> {
    fn reset(&mut self) {
        // Do not even bother trying to reset here, since `next` will take care of this when the timer expires.
    }
}
