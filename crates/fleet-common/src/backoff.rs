// Exponential backoff for retryable external calls. Bounded: once the
// attempt budget is spent the caller marks the affected record Failed
// instead of blocking the reconciliation loop on one broken resource.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, FleetResult};

/// Starting delay for the first retry.
const MIN_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the delay between attempts.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Multiplier for exponential growth.
const DELAY_MULTIPLIER: f64 = 2.0;

/// Bounded exponential backoff state.
///
/// Each call to `wait` sleeps for the current delay and doubles it (capped
/// at `MAX_DELAY`). `exhausted` flips once the configured attempt budget
/// has been consumed.
#[derive(Debug)]
pub struct Backoff {
    current_delay: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            current_delay: MIN_DELAY,
            attempts: 0,
            max_attempts,
        }
    }

    /// Number of attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay the next `wait` call would sleep for.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consume one attempt without sleeping.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        let next_ms = (self.current_delay.as_millis() as f64 * DELAY_MULTIPLIER) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(MAX_DELAY);
    }

    /// Sleep for the current delay, honoring an override from the remote
    /// side (Retry-After), then grow the delay.
    ///
    /// Returns `false` if the wait was cancelled.
    pub async fn wait(&mut self, hint: Option<Duration>, cancel: &CancellationToken) -> bool {
        let delay = hint.unwrap_or(self.current_delay).min(MAX_DELAY);

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };

        self.record_attempt();
        completed
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or spends
/// the attempt budget. Timeouts are returned immediately: their outcome is
/// unknown and must be resolved by the next drift listing, not by blindly
/// re-issuing the call.
pub fn retry<'a, T, F, Fut>(
    op_name: &'a str,
    max_attempts: u32,
    cancel: CancellationToken,
    mut op: F,
) -> impl Future<Output = FleetResult<T>> + Send + 'a
where
    F: FnMut() -> Fut + Send + 'a,
    Fut: Future<Output = FleetResult<T>> + Send,
    T: Send + 'a,
{
    async move {
        let mut backoff = Backoff::new(max_attempts);

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err @ FleetError::Timeout(_)) => return Err(err),
                Err(err) if err.is_retryable() && !backoff.exhausted() => {
                    let hint = match &err {
                        FleetError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };

                    tracing::warn!(
                        op = op_name,
                        attempt = backoff.attempts() + 1,
                        error = %err,
                        "retryable failure, backing off"
                    );

                    if !backoff.wait(hint, &cancel).await {
                        return Err(err);
                    }
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(
                            op = op_name,
                            attempts = backoff.attempts(),
                            error = %err,
                            "retry budget exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
