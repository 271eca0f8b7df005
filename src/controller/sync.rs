//! Per-kind sync drivers
//!
//! Every derived kind is driven through the same three steps:
//! [`KindSync::compute_desired`], [`KindSync::fetch_observed`] and
//! [`KindSync::apply_diff`]. A single generic driver, [`TypedSync`],
//! implements them for any [`DerivedResource`]; kinds only differ in which
//! top-level fields the controller manages and how they are compared.
//!
//! Comparison rules:
//! - merged fields: the observed value must contain the desired value
//!   (server-populated defaults are tolerated); on drift the desired value is
//!   overlaid onto the observed one
//! - replaced fields: must equal the desired value exactly
//! - labels and annotations: desired entries must be present, foreign
//!   entries are kept
//! - owner reference: the Application must be the controller
//!
//! Kinds whose object count follows the spec (topics) are also pruned:
//! objects the Application controls that are no longer desired get deleted.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compiler::DesiredState;
use crate::crd::{DerivedRef, KafkaTopic};
use crate::owner::{controller_uid, link, OwnerLink};
use crate::retry::{fetch_with_retry, RetryFetch};
use crate::store::{api_resource, to_dynamic, ObjectKey, ObjectStore};
use crate::Error;

/// A kind the controller derives from an Application
pub trait DerivedResource:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Top-level fields overlaid onto the observed object on drift
    const MERGED_FIELDS: &'static [&'static str];

    /// Top-level fields owned outright and compared exactly
    const REPLACED_FIELDS: &'static [&'static str] = &[];

    /// Stale objects of this kind are deleted after each pass
    const PRUNED: bool = false;

    /// Objects of this kind in the desired state, in order
    fn select(desired: &DesiredState) -> Vec<Self>;
}

impl DerivedResource for Deployment {
    const MERGED_FIELDS: &'static [&'static str] = &["spec"];

    fn select(desired: &DesiredState) -> Vec<Self> {
        vec![desired.deployment.clone()]
    }
}

impl DerivedResource for Service {
    const MERGED_FIELDS: &'static [&'static str] = &["spec"];

    fn select(desired: &DesiredState) -> Vec<Self> {
        vec![desired.service.clone()]
    }
}

impl DerivedResource for Secret {
    const MERGED_FIELDS: &'static [&'static str] = &[];
    const REPLACED_FIELDS: &'static [&'static str] = &["type", "data"];

    fn select(desired: &DesiredState) -> Vec<Self> {
        vec![desired.secret.clone()]
    }
}

impl DerivedResource for KafkaTopic {
    const MERGED_FIELDS: &'static [&'static str] = &["spec"];
    const PRUNED: bool = true;

    fn select(desired: &DesiredState) -> Vec<Self> {
        desired.topics.clone()
    }
}

/// What applying one object did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The object did not exist and was created
    Created,
    /// The object drifted and was replaced
    Updated,
    /// The object already matched
    Unchanged,
}

impl SyncOutcome {
    /// True when the store was written
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Inputs shared by every driver during one reconcile
pub struct SyncContext<'a> {
    /// Object store
    pub store: &'a dyn ObjectStore,
    /// Owner stamped onto every object
    pub owner: &'a OwnerLink,
    /// Namespace of the Application and everything it owns
    pub namespace: &'a str,
    /// Immediate refetch-and-retry rounds on write races
    pub conflict_retries: u32,
    /// Polling policy when a just-created object is not yet readable
    pub fetch: RetryFetch,
    /// Interrupts retry waits
    pub cancel: &'a CancellationToken,
}

/// Capability interface implemented once per derived kind
#[async_trait]
pub trait KindSync: Send + Sync {
    /// Kind name, e.g. `Deployment`
    fn kind(&self) -> &str;

    /// Desired objects of this kind, owner references stamped
    fn compute_desired(
        &self,
        desired: &DesiredState,
        owner: &OwnerLink,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Current object with `key`, `None` when absent
    async fn fetch_observed(
        &self,
        store: &dyn ObjectStore,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Converge the observed object to `desired`
    async fn apply_diff(
        &self,
        ctx: &SyncContext<'_>,
        desired: &DynamicObject,
        observed: Option<DynamicObject>,
    ) -> Result<SyncOutcome, Error>;

    /// Delete objects of this kind controlled by `ctx.owner` whose names are
    /// not in `keep`. Returns the deleted objects.
    async fn prune(
        &self,
        ctx: &SyncContext<'_>,
        keep: &BTreeSet<String>,
    ) -> Result<Vec<DerivedRef>, Error>;
}

/// Generic driver for any [`DerivedResource`]
pub struct TypedSync<K> {
    kind: String,
    resource: ApiResource,
    _marker: PhantomData<fn() -> K>,
}

impl<K: DerivedResource> TypedSync<K> {
    /// Create the driver for `K`
    pub fn new() -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            resource: api_resource::<K>(),
            _marker: PhantomData,
        }
    }
}

impl<K: DerivedResource> Default for TypedSync<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: DerivedResource> KindSync for TypedSync<K> {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn compute_desired(
        &self,
        desired: &DesiredState,
        owner: &OwnerLink,
    ) -> Result<Vec<DynamicObject>, Error> {
        K::select(desired)
            .into_iter()
            .map(|mut object| {
                link(object.meta_mut(), owner);
                to_dynamic(&object)
            })
            .collect()
    }

    async fn fetch_observed(
        &self,
        store: &dyn ObjectStore,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error> {
        match store.get(&self.resource, key).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_diff(
        &self,
        ctx: &SyncContext<'_>,
        desired: &DynamicObject,
        mut observed: Option<DynamicObject>,
    ) -> Result<SyncOutcome, Error> {
        let key = ObjectKey::new(
            ctx.namespace,
            desired.metadata.name.clone().unwrap_or_default(),
        );
        let mut races = 0u32;

        loop {
            let attempt = match observed.take() {
                None => self.create(ctx, desired).await,
                Some(current) => self.update(ctx, &key, desired, current).await,
            };

            match attempt {
                Err(e) if (e.is_conflict() || e.is_already_exists() || e.is_not_found())
                    && races < ctx.conflict_retries =>
                {
                    races += 1;
                    debug!(kind = %self.kind, object = %key, races, error = %e, "write raced, refetching");
                    observed = if e.is_already_exists() {
                        // The object exists but may not be readable yet
                        Some(
                            fetch_with_retry(ctx.store, &self.resource, &key, &ctx.fetch, ctx.cancel)
                                .await?,
                        )
                    } else {
                        self.fetch_observed(ctx.store, &key).await?
                    };
                }
                other => return other,
            }
        }
    }

    async fn prune(
        &self,
        ctx: &SyncContext<'_>,
        keep: &BTreeSet<String>,
    ) -> Result<Vec<DerivedRef>, Error> {
        if !K::PRUNED {
            return Ok(vec![]);
        }

        let stale: Vec<ObjectKey> = ctx
            .store
            .list(&self.resource, ctx.namespace)
            .await?
            .iter()
            .filter(|object| controller_uid(&object.metadata) == Some(ctx.owner.uid.as_str()))
            .filter_map(|object| ObjectKey::from_meta(&object.metadata))
            .filter(|key| !keep.contains(&key.name))
            .collect();

        let mut pruned = Vec::with_capacity(stale.len());
        for key in stale {
            match ctx.store.delete(&self.resource, &key).await {
                Ok(()) => info!(kind = %self.kind, name = %key.name, "pruned"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            pruned.push(DerivedRef {
                kind: self.kind.clone(),
                name: key.name,
            });
        }
        Ok(pruned)
    }
}

impl<K: DerivedResource> TypedSync<K> {
    async fn create(
        &self,
        ctx: &SyncContext<'_>,
        desired: &DynamicObject,
    ) -> Result<SyncOutcome, Error> {
        ctx.store.create(&self.resource, desired).await?;
        info!(
            kind = %self.kind,
            name = desired.metadata.name.as_deref().unwrap_or_default(),
            "created"
        );
        Ok(SyncOutcome::Created)
    }

    async fn update(
        &self,
        ctx: &SyncContext<'_>,
        key: &ObjectKey,
        desired: &DynamicObject,
        current: DynamicObject,
    ) -> Result<SyncOutcome, Error> {
        if let Some(uid) = controller_uid(&current.metadata) {
            if uid != ctx.owner.uid {
                return Err(Error::ownership_conflict(
                    &self.kind,
                    &key.namespace,
                    &key.name,
                    format!("controller uid {}", uid),
                ));
            }
        }

        match converge::<K>(current, desired, ctx.owner) {
            None => Ok(SyncOutcome::Unchanged),
            Some(next) => {
                ctx.store.replace(&self.resource, &next).await?;
                info!(kind = %self.kind, name = %key.name, "updated");
                Ok(SyncOutcome::Updated)
            }
        }
    }
}

/// The observed object with desired state applied, or `None` if it already matches
fn converge<K: DerivedResource>(
    current: DynamicObject,
    desired: &DynamicObject,
    owner: &OwnerLink,
) -> Option<DynamicObject> {
    let mut next = current;
    let mut changed = false;

    changed |= merge_entries(&mut next.metadata.labels, &desired.metadata.labels);
    changed |= merge_entries(&mut next.metadata.annotations, &desired.metadata.annotations);
    changed |= link(&mut next.metadata, owner);

    if !next.data.is_object() {
        next.data = Value::Object(Default::default());
    }
    let Some(body) = next.data.as_object_mut() else {
        return None;
    };

    for field in K::MERGED_FIELDS {
        let Some(want) = desired.data.get(*field) else {
            continue;
        };
        let have = body.entry(field.to_string()).or_insert(Value::Null);
        if !contains(have, want) {
            overlay(have, want);
            changed = true;
        }
    }

    for field in K::REPLACED_FIELDS {
        let want = desired.data.get(*field);
        if body.get(*field) != want {
            match want {
                Some(value) => {
                    body.insert(field.to_string(), value.clone());
                }
                None => {
                    body.remove(*field);
                }
            }
            changed = true;
        }
    }

    changed.then_some(next)
}

fn merge_entries(
    have: &mut Option<std::collections::BTreeMap<String, String>>,
    want: &Option<std::collections::BTreeMap<String, String>>,
) -> bool {
    let Some(want) = want else {
        return false;
    };
    let have = have.get_or_insert_with(Default::default);
    let mut changed = false;
    for (k, v) in want {
        if have.get(k) != Some(v) {
            have.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// True when every value in `want` is present in `have`.
///
/// Objects may carry extra keys; arrays must match element-wise.
fn contains(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(h), Value::Object(w)) => w
            .iter()
            .all(|(k, wv)| h.get(k).map(|hv| contains(hv, wv)).unwrap_or(false)),
        (Value::Array(h), Value::Array(w)) => {
            h.len() == w.len() && h.iter().zip(w).all(|(hv, wv)| contains(hv, wv))
        }
        (h, w) => h == w,
    }
}

/// Write `want` into `have`: objects merge key by key, anything else is replaced
fn overlay(have: &mut Value, want: &Value) {
    match (have, want) {
        (Value::Object(h), Value::Object(w)) => {
            for (k, wv) in w {
                overlay(h.entry(k.clone()).or_insert(Value::Null), wv);
            }
        }
        (have, want) => *have = want.clone(),
    }
}

/// Drivers for every derived kind, in apply order.
///
/// The Secret goes first so the Deployment never mounts a missing volume.
pub fn default_drivers() -> Vec<Box<dyn KindSync>> {
    vec![
        Box::new(TypedSync::<Secret>::new()),
        Box::new(TypedSync::<Service>::new()),
        Box::new(TypedSync::<Deployment>::new()),
        Box::new(TypedSync::<KafkaTopic>::new()),
    ]
}

/// An object that could not be converged
#[derive(Debug)]
pub struct SyncFailure {
    /// The object
    pub object: DerivedRef,
    /// Why
    pub error: Error,
}

/// Result of syncing every derived object of one Application
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Objects that now match the desired state
    pub converged: Vec<DerivedRef>,
    /// Objects that could not be converged
    pub failures: Vec<SyncFailure>,
    /// Store writes performed
    pub writes: usize,
}

impl SyncReport {
    /// True when every object converged
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every driver over the desired state.
///
/// A failing object does not stop the others. Only a desired object that
/// cannot be encoded aborts the pass. Within one kind, a repeated name is
/// rejected as already existing and the first object of that name is left
/// untouched. Once a kind is applied, its stale objects are pruned.
pub async fn sync_all(
    drivers: &[Box<dyn KindSync>],
    desired: &DesiredState,
    ctx: &SyncContext<'_>,
) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();

    for driver in drivers {
        let objects = driver.compute_desired(desired, ctx.owner)?;
        let mut seen = BTreeSet::new();

        for object in objects {
            let name = object.metadata.name.clone().unwrap_or_default();
            let reference = DerivedRef {
                kind: driver.kind().to_string(),
                name: name.clone(),
            };

            if !seen.insert(name.clone()) {
                report.failures.push(SyncFailure {
                    object: reference,
                    error: Error::already_exists(driver.kind(), ctx.namespace, &name),
                });
                continue;
            }

            let key = ObjectKey::new(ctx.namespace, &name);
            let outcome = match driver.fetch_observed(ctx.store, &key).await {
                Ok(observed) => driver.apply_diff(ctx, &object, observed).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(outcome) => {
                    if outcome.is_write() {
                        report.writes += 1;
                    }
                    report.converged.push(reference);
                }
                Err(error) => report.failures.push(SyncFailure {
                    object: reference,
                    error,
                }),
            }
        }

        match driver.prune(ctx, &seen).await {
            Ok(pruned) => report.writes += pruned.len(),
            Err(error) => report.failures.push(SyncFailure {
                object: DerivedRef {
                    kind: driver.kind().to_string(),
                    name: "(prune)".to_string(),
                },
                error,
            }),
        }
    }

    Ok(report)
}
