//! Controller tuning
//!
//! Every knob is a CLI flag with a `WEAVER_*` environment fallback, so the
//! same binary can be configured from a Deployment manifest or a terminal.

use std::time::Duration;

use clap::Args;

use crate::retry::{Backoff, RetryFetch};

/// Runtime configuration for the reconciliation controller
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "WEAVER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Deadline for a single object store request, in seconds
    #[arg(long, env = "WEAVER_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Deadline for one whole reconcile, in seconds
    #[arg(long, env = "WEAVER_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    pub reconcile_timeout_secs: u64,

    /// Reads attempted when resolving a Base before deferring
    #[arg(long, env = "WEAVER_BASE_FETCH_ATTEMPTS", default_value_t = 3)]
    pub base_fetch_attempts: u32,

    /// Wait between Base reads, in milliseconds
    #[arg(long, env = "WEAVER_BASE_FETCH_DELAY_MS", default_value_t = 500)]
    pub base_fetch_delay_ms: u64,

    /// Immediate refetch-and-retry rounds after a stale-version write
    #[arg(long, env = "WEAVER_CONFLICT_RETRIES", default_value_t = 3)]
    pub conflict_retries: u32,

    /// First requeue delay after a failed reconcile, in milliseconds
    #[arg(long, env = "WEAVER_BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    /// Longest requeue delay after failed reconciles, in seconds
    #[arg(long, env = "WEAVER_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Consecutive failures before an Application is marked Degraded and
    /// left until its next change
    #[arg(long, env = "WEAVER_MAX_FAILURES", default_value_t = 10)]
    pub max_failures: u32,

    /// Interval between drift-repair reconciles of healthy Applications, in seconds
    #[arg(long, env = "WEAVER_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Time in-flight reconciles get to finish on shutdown, in seconds
    #[arg(long, env = "WEAVER_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WEAVER_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            request_timeout_secs: 10,
            reconcile_timeout_secs: 60,
            base_fetch_attempts: 3,
            base_fetch_delay_ms: 500,
            conflict_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_secs: 300,
            max_failures: 10,
            resync_secs: 300,
            shutdown_grace_secs: 30,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Per-request store deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Whole-reconcile deadline
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Polling policy for resolving a Base
    pub fn base_fetch(&self) -> RetryFetch {
        RetryFetch {
            max_attempts: self.base_fetch_attempts,
            delay: Duration::from_millis(self.base_fetch_delay_ms),
        }
    }

    /// Requeue schedule for failed reconciles
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_secs(self.backoff_max_secs),
            multiplier: 2.0,
        }
    }

    /// Drift-repair interval
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
