//! Application reconciliation
//!
//! One pass converges everything an Application owns:
//! fetch Application, resolve Base, validate, compile, link owners, sync each
//! kind, record status. The pass is idempotent: rerunning it against a
//! converged store performs no writes.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::compiler::compile;
use crate::crd::{
    AppPhase, Application, ApplicationStatus, Base, Condition, ConditionStatus, DerivedRef,
};
use crate::error::ErrorClass;
use crate::owner::OwnerLink;
use crate::retry::fetch_with_retry;
use crate::schema;
use crate::store::{api_resource, from_dynamic, get_typed, ObjectKey};
use crate::Error;

use super::sync::{default_drivers, sync_all, SyncContext};
use super::Context;

/// Condition type reported on every Application
pub const READY_CONDITION: &str = "Ready";

/// Condition reasons
pub mod reason {
    /// Every derived object matches the desired state
    pub const RECONCILED: &str = "Reconciled";
    /// The referenced Base does not exist (yet)
    pub const BASE_NOT_FOUND: &str = "BaseNotFound";
    /// The Application itself is invalid; waits for a spec change
    pub const INVALID_APPLICATION: &str = "InvalidApplication";
    /// The referenced Base is invalid for this Application
    pub const INVALID_BASE: &str = "InvalidBase";
    /// The configuration could not be rendered
    pub const RENDER_FAILED: &str = "RenderFailed";
    /// Some derived objects could not be converged
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// Consecutive failures hit the retry cap
    pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";
}

/// What the scheduler should do with a key after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Run again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Run again only when an event arrives
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Delay before the next timed run, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Reconcile the Application identified by `key`
///
/// # Returns
///
/// - `Ok(requeue(resync))` when converged, or when the only failures need an
///   external change (ownership or duplicate-name conflicts)
/// - `Ok(await_change())` for deleted Applications and terminal validation failures
/// - `Err(..)` for transient failures; the caller backs off and retries
#[instrument(skip(key, ctx), fields(application = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let store = ctx.store.as_ref();

    let app: Application = match get_typed(store, key).await {
        Ok(app) => app,
        Err(e) if e.is_not_found() => {
            debug!("application gone, owned objects are left to garbage collection");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if app.metadata.deletion_timestamp.is_some() {
        debug!("application is being deleted");
        return Ok(Action::await_change());
    }

    if invalid_at_current_generation(&app) {
        debug!("spec unchanged since it was rejected");
        return Ok(Action::await_change());
    }

    if let Err(e) = schema::validate_application(&app) {
        return fail_terminal(&app, key, reason::INVALID_APPLICATION, e, ctx).await;
    }

    let base_key = ObjectKey::new(&key.namespace, &app.spec.base);
    let base = match fetch_with_retry(
        store,
        &api_resource::<Base>(),
        &base_key,
        &ctx.config.base_fetch(),
        &ctx.cancel,
    )
    .await
    {
        Ok(object) => match from_dynamic::<Base>(&object) {
            Ok(base) => base,
            Err(e) => return fail_terminal(&app, key, reason::INVALID_BASE, e, ctx).await,
        },
        Err(e) if e.is_not_found() => {
            info!(base = %base_key.name, "base not found, deferring");
            let message = format!("waiting for Base '{}'", app.spec.base);
            let status = ApplicationStatus::with_phase(AppPhase::Pending)
                .message(message.clone())
                .observed_generation(app.metadata.generation)
                .condition(Condition::new(
                    READY_CONDITION,
                    ConditionStatus::False,
                    reason::BASE_NOT_FOUND,
                    message,
                ))
                .derived_objects(previous_derived(&app));
            update_status(&app, key, status, ctx).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let inputs = match schema::validate(&base, &app) {
        Ok(inputs) => inputs,
        Err(e) => return fail_terminal(&app, key, reason::INVALID_BASE, e, ctx).await,
    };

    let desired = match compile(&inputs, ctx.renderer.as_ref()) {
        Ok(desired) => desired,
        Err(e) if e.class() == ErrorClass::Terminal => {
            return fail_terminal(&app, key, reason::RENDER_FAILED, e, ctx).await;
        }
        Err(e) => return Err(e),
    };

    let owner = OwnerLink::for_application(&app)?;
    let sync_ctx = SyncContext {
        store,
        owner: &owner,
        namespace: &key.namespace,
        conflict_retries: ctx.config.conflict_retries,
        fetch: ctx.config.base_fetch(),
        cancel: &ctx.cancel,
    };
    let report = sync_all(&default_drivers(), &desired, &sync_ctx).await?;

    if report.is_clean() {
        let message = format!("{} objects converged", report.converged.len());
        let status = ApplicationStatus::with_phase(AppPhase::Ready)
            .message(message.clone())
            .observed_generation(app.metadata.generation)
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::True,
                reason::RECONCILED,
                message,
            ))
            .derived_objects(report.converged);
        update_status(&app, key, status, ctx).await?;

        if report.writes > 0 {
            info!(writes = report.writes, "application reconciled");
        } else {
            debug!("application already converged");
        }
        return Ok(Action::requeue(ctx.config.resync()));
    }

    for failure in &report.failures {
        warn!(
            kind = %failure.object.kind,
            name = %failure.object.name,
            error = %failure.error,
            "derived object not converged"
        );
    }

    let message = report
        .failures
        .iter()
        .map(|f| format!("{} {}: {}", f.object.kind, f.object.name, f.error))
        .collect::<Vec<_>>()
        .join("; ");
    let status = ApplicationStatus::with_phase(AppPhase::Degraded)
        .message(message.clone())
        .observed_generation(app.metadata.generation)
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            reason::SYNC_FAILED,
            message,
        ))
        .derived_objects(report.converged);
    update_status(&app, key, status, ctx).await?;

    // Ownership and duplicate-name conflicts need someone to change the
    // cluster; everything else is worth retrying on a backoff.
    match report
        .failures
        .into_iter()
        .find(|f| needs_retry(&f.error))
    {
        Some(failure) => Err(failure.error),
        None => Ok(Action::requeue(ctx.config.resync())),
    }
}

fn needs_retry(error: &Error) -> bool {
    !matches!(
        error,
        Error::OwnershipConflict { .. } | Error::AlreadyExists { .. }
    )
}

fn invalid_at_current_generation(app: &Application) -> bool {
    app.failed_at_current_generation()
        && app
            .status
            .as_ref()
            .and_then(|s| s.get_condition(READY_CONDITION))
            .map(|c| c.reason == reason::INVALID_APPLICATION)
            .unwrap_or(false)
}

fn previous_derived(app: &Application) -> Vec<DerivedRef> {
    app.status
        .as_ref()
        .map(|s| s.derived_objects.clone())
        .unwrap_or_default()
}

/// Record a failure no retry can fix and stop timed retries
async fn fail_terminal(
    app: &Application,
    key: &ObjectKey,
    reason: &str,
    error: Error,
    ctx: &Context,
) -> Result<Action, Error> {
    warn!(error = %error, reason, "application rejected");

    let status = ApplicationStatus::with_phase(AppPhase::Failed)
        .message(error.to_string())
        .observed_generation(app.metadata.generation)
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            reason,
            error.to_string(),
        ))
        .derived_objects(previous_derived(app));
    update_status(app, key, status, ctx).await?;

    Ok(Action::await_change())
}

/// Mark an Application Degraded after `failures` consecutive failed reconciles
pub async fn mark_degraded(
    key: &ObjectKey,
    error: &Error,
    failures: u32,
    ctx: &Context,
) -> Result<(), Error> {
    let app: Application = match get_typed(ctx.store.as_ref(), key).await {
        Ok(app) => app,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    let message = format!(
        "giving up after {} consecutive failures: {}",
        failures, error
    );
    let status = ApplicationStatus::with_phase(AppPhase::Degraded)
        .message(message.clone())
        .observed_generation(app.metadata.generation)
        .condition(Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            reason::RETRIES_EXHAUSTED,
            message,
        ))
        .derived_objects(previous_derived(&app));

    update_status(&app, key, status, ctx).await
}

/// Write `status` unless the Application already reports the same state
async fn update_status(
    app: &Application,
    key: &ObjectKey,
    status: ApplicationStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let previous = app.status.as_ref();
    if previous.map(|p| p.is_equivalent(&status)).unwrap_or(false) {
        debug!(phase = %status.phase, "status unchanged");
        return Ok(());
    }

    let status = status.carry_transition_times(previous);
    debug!(phase = %status.phase, "updating status");
    ctx.store
        .patch_status(&api_resource::<Application>(), key, &status_patch(&status)?)
        .await
}

/// Merge-patch body for `status`; fields left unset are cleared explicitly
fn status_patch(status: &ApplicationStatus) -> Result<serde_json::Value, Error> {
    let mut patch = serde_json::to_value(status)?;
    if let Some(map) = patch.as_object_mut() {
        for field in ["message", "observedGeneration", "conditions", "derivedObjects"] {
            map.entry(field).or_insert(serde_json::Value::Null);
        }
    }
    Ok(patch)
}
