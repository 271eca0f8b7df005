//! Application controller
//!
//! Watches Applications and Bases, compiles each Application against its
//! Base and converges the derived Deployment, Service, Secret and
//! KafkaTopics with observe-diff-act loops.

mod context;
mod queue;
mod reconcile;
mod runtime;
mod sync;
mod watch;

pub use context::{Context, ContextBuilder};
pub use queue::{KeyState, WorkQueue};
pub use reconcile::{mark_degraded, reason, reconcile, Action, READY_CONDITION};
pub use runtime::Controller;
pub use sync::{
    default_drivers, sync_all, DerivedResource, KindSync, SyncContext, SyncFailure, SyncOutcome,
    SyncReport, TypedSync,
};
pub use watch::{kube_events, store_events, GenerationFilter, WatchEvent};
