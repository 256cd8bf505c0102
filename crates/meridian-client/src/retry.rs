//! Retry Logic with Exponential Backoff
//!
//! Used for the control-plane calls a producer makes while it is being
//! created (partition lookup, connecting to partition leaders). Individual
//! messages are never retried here: once a batch is formed, re-sending it is
//! the partition connection's job.
//!
//! ## Backoff Schedule
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 3            │
//! │  - initial_backoff: 100ms    │
//! │  - max_backoff: 5s           │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait ~100ms
//!        ├─→ Attempt 3: Wait ~200ms
//!        └─→ Attempt 4: Wait ~400ms
//! ```
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! Classification follows [`ClientError::is_retryable`]: transport failures
//! are retried, configuration and lifecycle errors are returned at once.
//!
//! ## Examples
//!
//! ```ignore
//! use meridian_client::retry::{RetryPolicy, retry_with_jittered_backoff};
//!
//! let metadata = retry_with_jittered_backoff(&RetryPolicy::default(), || async {
//!     lookup.resolve("orders").await
//! }).await?;
//! ```

use crate::error::{ClientError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration.
///
/// # Examples
///
/// ```ignore
/// // Fail fast, e.g. in tests
/// let policy = RetryPolicy::none();
///
/// // Patient startup against a cluster that is still electing leaders
/// let policy = RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(10), 2.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first one
    pub max_retries: usize,

    /// Backoff before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed):
    /// `min(initial_backoff * multiplier^attempt, max_backoff)`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }

    /// [`backoff`](Self::backoff) scaled by a random factor in `[0.75, 1.25)`,
    /// so that producers restarted together do not retry in lockstep.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.75..1.25);
        Duration::from_millis((self.backoff(attempt).as_millis() as f64 * jitter) as u64)
    }

    pub fn is_retryable(&self, err: &ClientError) -> bool {
        err.is_retryable()
    }
}

/// Retry an operation with jittered exponential backoff.
///
/// # Returns
///
/// - `Ok(T)` if the operation succeeds within `max_retries`
/// - `Err` with the last error once retries are exhausted, or immediately
///   for a non-retryable error
pub async fn retry_with_jittered_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !policy.is_retryable(&err) {
                    debug!(error = %err, "Non-retryable error, giving up");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.jittered_backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retryable error, backing off with jitter"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
