//! Retry coordinator - bounded exponential backoff with jitter.
//!
//! Responsibilities:
//! - Invoke an operation until it succeeds, a fatal error surfaces, or the
//!   attempt bound is reached
//! - Classify failures through the error's own `Classify` impl; anything
//!   not positively recoverable is fatal
//! - Checkpoint through the supplied hook immediately before every attempt
//!   and once after the final outcome, so an externally observed session
//!   reflects in-flight attempts
//!
//! Waits block only the calling task; retries bound a single external
//! call, never the whole pipeline.

use nlq_core::{Classify, ErrorClass, RetrySettings};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Bookkeeping for one call sequence. The attempt counter is monotonic
/// within a sequence and never reused across sequences.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation: String,
    pub attempt: u32,
    pub last_error: Option<String>,
    /// True only for the checkpoint after the final outcome.
    pub finished: bool,
}

/// Hook invoked around attempts; used to persist session state.
#[async_trait::async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self, ctx: &RetryContext);
}

/// Checkpointer that does nothing.
pub struct NoCheckpoint;

#[async_trait::async_trait]
impl Checkpointer for NoCheckpoint {
    async fn checkpoint(&self, _ctx: &RetryContext) {}
}

/// Terminal outcome of a retried call sequence.
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    /// Non-retryable failure; surfaced immediately, zero sleeps.
    #[error("fatal error: {0}")]
    Fatal(E),

    /// The attempt bound was reached; wraps the last failure.
    #[error("retry attempts exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    settings: RetrySettings,
}

impl RetryCoordinator {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// Backoff for a 0-indexed attempt:
    /// `min(base * multiplier^attempt, max)`, optionally jittered by ±25%.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.settings.base_delay_secs;
        let mut delay = (base * self.settings.multiplier.powi(attempt as i32))
            .min(self.settings.max_delay_secs);

        if self.settings.jitter && delay > 0.0 {
            let jitter_range = delay * 0.25;
            delay += rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            delay = delay.max(0.0);
        }

        Duration::from_secs_f64(delay)
    }

    /// Run `op` under the retry policy.
    pub async fn execute<T, E, Op, Fut>(
        &self,
        operation: &str,
        checkpointer: &dyn Checkpointer,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: Classify + std::fmt::Display,
    {
        let mut ctx = RetryContext {
            operation: operation.to_string(),
            attempt: 0,
            last_error: None,
            finished: false,
        };

        loop {
            ctx.attempt += 1;
            checkpointer.checkpoint(&ctx).await;

            match op().await {
                Ok(value) => {
                    ctx.last_error = None;
                    ctx.finished = true;
                    checkpointer.checkpoint(&ctx).await;
                    return Ok(value);
                }
                Err(e) => {
                    ctx.last_error = Some(e.to_string());

                    if e.classify() == ErrorClass::Fatal {
                        error!(
                            operation = operation,
                            attempt = ctx.attempt,
                            error = %e,
                            "fatal error, not retrying"
                        );
                        ctx.finished = true;
                        checkpointer.checkpoint(&ctx).await;
                        return Err(RetryError::Fatal(e));
                    }

                    if ctx.attempt >= self.settings.max_attempts {
                        error!(
                            operation = operation,
                            attempts = ctx.attempt,
                            "all retry attempts exhausted"
                        );
                        ctx.finished = true;
                        checkpointer.checkpoint(&ctx).await;
                        return Err(RetryError::Exhausted {
                            attempts: ctx.attempt,
                            last: e,
                        });
                    }

                    let delay = self.delay(ctx.attempt - 1);
                    warn!(
                        operation = operation,
                        attempt = ctx.attempt,
                        max_attempts = self.settings.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "recoverable error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
