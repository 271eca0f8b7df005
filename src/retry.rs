//! Retry utilities
//!
//! Two flavours:
//! - [`fetch_with_retry`]: bounded, fixed-interval polling read that tolerates
//!   propagation delay (an object written moments ago may not be readable
//!   yet). Cancellable.
//! - [`retry_with_backoff`]: general exponential backoff with jitter for
//!   bootstrap-time operations such as CRD installation.
//!
//! [`Backoff`] is the delay schedule shared by `retry_with_backoff` and the
//! controller's requeue policy.

use std::time::Duration;

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::store::{ObjectKey, ObjectStore};
use crate::Error;

/// Exponential delay schedule with jitter
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
    /// Multiplier applied per attempt
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Un-jittered delay after `attempt` failures (1-based), capped at `max`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Jittered delay after `attempt` failures: 0.5x to 1.5x of the base
    /// delay, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter).min(self.max)
    }
}

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `max_attempts` is exhausted, in which
/// case the last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.backoff.delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Polling policy for [`fetch_with_retry`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryFetch {
    /// Total reads attempted before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Wait between reads
    pub delay: Duration,
}

impl Default for RetryFetch {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Read an object, retrying while it is not yet visible.
///
/// Returns the first successful read. `NotFound` is retried every
/// `policy.delay` until `policy.max_attempts` reads were made, then returned.
/// Any other error is returned immediately. Cancelling `cancel` while waiting
/// yields [`Error::Cancelled`].
pub async fn fetch_with_retry(
    store: &dyn ObjectStore,
    resource: &ApiResource,
    key: &ObjectKey,
    policy: &RetryFetch,
    cancel: &CancellationToken,
) -> Result<DynamicObject, Error> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match store.get(resource, key).await {
            Ok(object) => return Ok(object),
            Err(e) if e.is_not_found() && attempt < attempts => {
                debug!(
                    kind = %resource.kind,
                    object = %key,
                    attempt,
                    "object not visible yet, waiting"
                );
            }
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!(
                    "fetch of {} {} cancelled",
                    resource.kind, key
                )));
            }
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}
