//! Retry Logic with Exponential Backoff
//!
//! Control-plane requests (create/destroy producer, consumer, station) are
//! retried when the broker does not answer in time. Every other failure is
//! returned immediately: a "no responders" answer means the control plane
//! is absent, and an error reply will not change on retry.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Client::request()   │ control-plane JSON request
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 5            │
//! │  - initial_backoff: 100ms    │
//! │  - max_backoff: 5s           │
//! │  - backoff_multiplier: 2.0   │
//! └──────────┬───────────────────┘
//!            │
//!            ├─→ Attempt 1: Immediate
//!            ├─→ Attempt 2: Wait 100ms
//!            ├─→ Attempt 3: Wait 200ms
//!            └─→ ...
//! ```
//!
//! ## Examples
//!
//! ```ignore
//! use stationhouse_client::retry::{RetryPolicy, retry_with_jittered_backoff};
//!
//! let policy = RetryPolicy::default();
//! let reply = retry_with_jittered_backoff(&policy, || async {
//!     broker.request(subject, payload.clone(), timeout).await
//! }).await?;
//! ```

use stationhouse_broker::BrokerError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: usize,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
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

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Only timeouts are transient. Absence, closed connections and explicit
    /// broker errors are returned to the caller as-is.
    pub fn is_retryable(&self, error: &BrokerError) -> bool {
        match error {
            BrokerError::Timeout(_) => true,

            BrokerError::NoResponders(_) => false,
            BrokerError::StreamNotFound(_) => false,
            BrokerError::ConsumerNotFound { .. } => false,
            BrokerError::SubscriptionClosed(_) => false,
            BrokerError::ConnectionClosed => false,
            BrokerError::InvalidAckToken(_) => false,
            BrokerError::Internal(_) => false,
        }
    }
}

/// Retry a broker operation with jittered exponential backoff.
///
/// Adds ±25% jitter so clients that time out together do not retry in
/// lockstep.
///
/// ```text
/// jittered_backoff = backoff * (0.75 + random(0.0, 0.5))
/// ```
pub async fn retry_with_jittered_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
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
            Err(error) => {
                if !policy.is_retryable(&error) {
                    return Err(error);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %error,
                        "Max retries exhausted, giving up"
                    );
                    return Err(error);
                }

                let jitter = 0.75 + (rand::random::<f64>() * 0.5);
                let backoff = Duration::from_millis(
                    (policy.backoff(attempt).as_millis() as f64 * jitter) as u64,
                );
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Retryable error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
