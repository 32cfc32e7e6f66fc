//! Per-attempt timeout plus exponential backoff with jitter.
//!
//! Every provider call in the indexing and retrieval paths goes
//! through [`with_retry_and_timeout`]. The retry loop:
//!
//! - bounds each attempt with the supplied timeout;
//! - sleeps between attempts with exponentially growing, jittered
//!   delays (capped at the policy's maximum);
//! - short-circuits on non-retryable errors (authentication,
//!   configuration, cancellation);
//! - races both the attempt and the backoff sleep against the
//!   cancellation token so in-flight work is interrupted.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Run `operation` with retries. `make_attempt` is invoked once per
/// attempt and must produce a fresh future each time.
pub async fn with_retry_and_timeout<T, F, Fut>(
    timeout: Duration,
    policy: &RetryConfig,
    cancel: &CancelToken,
    mut make_attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        cancel.check()?;

        if attempt > 0 {
            let delay = backoff_delay(policy, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::IndexingAborted),
            }
        }

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, make_attempt()) => result,
            _ = cancel.cancelled() => return Err(Error::IndexingAborted),
        };

        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => {
                warn!(attempt = attempt + 1, error = %e, "attempt failed, will retry");
                last_err = Some(e);
            }
            Err(_) => {
                warn!(attempt = attempt + 1, "attempt timed out, will retry");
                last_err = Some(Error::Embedding(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Embedding("retries exhausted".into())))
}

/// Delay before `attempt` (1-based for delays): exponential growth
/// from the initial delay, capped, with ± `jitter` fraction applied.
fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exp = policy
        .initial_delay_ms
        .saturating_mul(1u64 << (attempt - 1).min(16));
    let capped = exp.min(policy.max_delay_ms);
    if policy.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }
    let spread = capped as f64 * policy.jitter;
    let jittered = capped as f64 + rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis(jittered.max(0.0) as u64)
}
