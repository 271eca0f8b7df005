//! Controller runtime
//!
//! Feeds watch events into the [`WorkQueue`], runs a fixed pool of workers
//! over it and turns reconcile outcomes into requeue decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::Application;
use crate::error::ErrorClass;
use crate::store::{list_typed, ObjectKey};
use crate::Error;

use super::reconcile::{mark_degraded, reconcile, Action};
use super::watch::WatchEvent;
use super::{Context, WorkQueue};

/// Reconciliation controller for Applications
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    /// Consecutive failed reconciles per Application
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Controller {
    /// Create a controller over `ctx`
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queue: Arc::new(WorkQueue::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// The work queue workers pull from
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Consecutive failures recorded for `key`
    pub fn failures_of(&self, key: &ObjectKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Route one watch event to the keys it affects.
    ///
    /// A Base event resolves to the Applications referencing it. When the
    /// listing fails it is retried on the controller backoff until it goes
    /// through, so parked dependents still see the change.
    pub async fn dispatch(&self, event: WatchEvent) {
        let base = match event {
            WatchEvent::Application(key) => {
                self.queue.add(key);
                return;
            }
            WatchEvent::Base(base) => base,
        };

        let backoff = self.ctx.config.backoff();
        let mut attempt = 0u32;
        loop {
            match self.dependents_of(&base).await {
                Ok(keys) => {
                    debug!(base = %base, dependents = keys.len(), "base changed");
                    for key in keys {
                        self.queue.add(key);
                    }
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = backoff.delay(attempt);
                    warn!(
                        base = %base,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "failed to list dependents of base, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Applications in the Base's namespace that reference it
    async fn dependents_of(&self, base: &ObjectKey) -> Result<Vec<ObjectKey>, Error> {
        let apps: Vec<Application> =
            list_typed::<Application>(self.ctx.store.as_ref(), &base.namespace).await?;

        Ok(apps
            .iter()
            .filter(|app| app.spec.base == base.name)
            .filter_map(|app| ObjectKey::from_meta(&app.metadata))
            .collect())
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// In-flight reconciles get the configured grace period to finish; after
    /// that the context token is cancelled and remaining workers are aborted.
    pub async fn run<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = WatchEvent> + Send,
    {
        let worker_count = self.ctx.config.workers.max(1);
        info!(workers = worker_count, "starting controller");

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let controller = Arc::clone(&self);
            workers.spawn(async move {
                while let Some(key) = controller.queue.next().await {
                    controller.process(&key).await;
                }
                debug!(worker = id, "worker stopped");
            });
        }

        // Base fan-outs list the store and may back off; they run beside
        // the intake loop
        let mut fan_outs = JoinSet::new();
        let mut events = std::pin::pin!(events);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = fan_outs.join_next(), if !fan_outs.is_empty() => {}
                event = events.next() => match event {
                    Some(WatchEvent::Application(key)) => self.queue.add(key),
                    Some(event) => {
                        let controller = Arc::clone(&self);
                        fan_outs.spawn(async move { controller.dispatch(event).await });
                    }
                    None => {
                        warn!("event stream ended, waiting for shutdown");
                        shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!("shutting down controller");
        fan_outs.shutdown().await;
        self.queue.shut_down();

        let grace = self.ctx.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "reconciles still running after grace period, cancelling"
            );
            self.ctx.cancel.cancel();
            workers.shutdown().await;
        }
        info!("controller stopped");
    }

    /// Reconcile `key` once and schedule its next run
    pub async fn process(&self, key: &ObjectKey) {
        let timeout = self.ctx.config.reconcile_timeout();
        let result = match tokio::time::timeout(timeout, reconcile(key, &self.ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("reconcile", timeout)),
        };

        let action = self.handle_result(key, result).await;
        match action.requeue_after() {
            Some(delay) => self.queue.add_after(key.clone(), delay),
            None => self.queue.cancel_delayed(key),
        }
        self.queue.done(key);
    }

    async fn handle_result(&self, key: &ObjectKey, result: Result<Action, Error>) -> Action {
        let error = match result {
            Ok(action) => {
                self.reset_failures(key);
                return action;
            }
            Err(e) => e,
        };

        if error.class() == ErrorClass::Terminal {
            warn!(application = %key, error = %error, "terminal reconcile error");
            self.reset_failures(key);
            return Action::await_change();
        }

        let failures = {
            let mut counts = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.ctx.config.max_failures {
            error!(
                application = %key,
                failures,
                error = %error,
                "giving up until the application changes"
            );
            if let Err(e) = mark_degraded(key, &error, failures, &self.ctx).await {
                warn!(application = %key, error = %e, "failed to mark application degraded");
            }
            self.reset_failures(key);
            return Action::await_change();
        }

        let delay = self.ctx.config.backoff().delay(failures);
        warn!(
            application = %key,
            failures,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "reconcile failed, requeueing"
        );
        Action::requeue(delay)
    }

    fn reset_failures(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
