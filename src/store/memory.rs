//! In-process ObjectStore
//!
//! Models the parts of an API server the controller depends on:
//! - optimistic concurrency via `resourceVersion`
//! - `generation` bumps on spec changes, status kept out of regular writes
//! - propagation delay: a freshly created object can stay invisible to reads
//!   for a configurable number of `get` calls
//! - owner-reference garbage collection on delete
//! - change notifications for driving the controller without a watch
//! - fault injection per operation and kind

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{DynamicObject, TypeMeta};
use kube::discovery::ApiResource;
use tokio::sync::broadcast;
use tracing::trace;

use super::{ObjectKey, ObjectStore};
use crate::Error;

/// Store operation, for fault injection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// `get`
    Get,
    /// `list`
    List,
    /// `create`
    Create,
    /// `replace`
    Replace,
    /// `delete`
    Delete,
    /// `patch_status`
    PatchStatus,
}

/// Injected failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail as if another writer got there first
    Conflict,
    /// Fail as if the store were unreachable
    Unavailable,
}

/// A change applied to the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    /// Kind of the changed object
    pub kind: String,
    /// Identity of the changed object
    pub key: ObjectKey,
    /// True when the object was removed
    pub deleted: bool,
    /// `metadata.generation` after the change
    pub generation: Option<i64>,
}

struct Entry {
    object: DynamicObject,
    hidden_reads: u32,
}

struct InjectedFault {
    op: StoreOp,
    kind: String,
    fault: Fault,
    remaining: u32,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, ObjectKey), Entry>,
    next_version: u64,
    next_uid: u64,
    faults: Vec<InjectedFault>,
    writes: BTreeMap<String, usize>,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_fault(&mut self, op: StoreOp, kind: &str) -> Option<Fault> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.op == op && f.kind == kind && f.remaining > 0)?;
        let entry = &mut self.faults[idx];
        entry.remaining -= 1;
        let fault = entry.fault;
        if entry.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(fault)
    }

    fn record_write(&mut self, kind: &str) {
        *self.writes.entry(kind.to_string()).or_default() += 1;
    }
}

/// In-memory object store
pub struct MemoryStore {
    state: Mutex<State>,
    read_lag: u32,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store where writes are immediately visible
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            read_lag: 0,
            events,
        }
    }

    /// Newly created objects miss the next `reads` `get` calls and are
    /// left out of lists until then
    pub fn with_read_lag(mut self, reads: u32) -> Self {
        self.read_lag = reads;
        self
    }

    /// Fail the next `times` calls of `op` on objects of `kind`
    pub fn inject(&self, op: StoreOp, kind: &str, fault: Fault, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(InjectedFault {
                op,
                kind: kind.to_string(),
                fault,
                remaining: times,
            });
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Successful writes (create, replace, delete, status patch) across all kinds
    pub fn write_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.writes.values().sum())
            .unwrap_or_default()
    }

    /// Successful writes to objects of `kind`
    pub fn writes_for(&self, kind: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.writes.get(kind).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of stored objects of `kind`, visible or not
    pub fn count(&self, kind: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.objects.keys().filter(|(k, _)| k == kind).count())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))
    }

    fn publish(&self, kind: &str, key: &ObjectKey, deleted: bool, generation: Option<i64>) {
        // No subscribers is fine
        let _ = self.events.send(StoreEvent {
            kind: kind.to_string(),
            key: key.clone(),
            deleted,
            generation,
        });
    }
}

fn fault_error(fault: Fault, resource: &ApiResource, key: &ObjectKey) -> Error {
    match fault {
        Fault::Conflict => Error::conflict(
            &resource.kind,
            &key.namespace,
            &key.name,
            "injected conflict",
        ),
        Fault::Unavailable => Error::internal(format!(
            "injected outage on {} {}",
            resource.kind, key
        )),
    }
}

fn key_of(object: &DynamicObject) -> Result<ObjectKey, Error> {
    ObjectKey::from_meta(&object.metadata)
        .ok_or_else(|| Error::internal("object is missing metadata.name or metadata.namespace"))
}

/// Fields compared to decide whether a write changes the object's spec
fn spec_fields(object: &DynamicObject) -> serde_json::Value {
    let mut data = object.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(Default::default());
            }
            if let Some(target_map) = target.as_object_mut() {
                for (k, v) in patch_map {
                    if v.is_null() {
                        target_map.remove(k);
                    } else {
                        merge_patch(target_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, Error> {
        let mut state = self.lock()?;
        if let Some(fault) = state.take_fault(StoreOp::Get, &resource.kind) {
            return Err(fault_error(fault, resource, key));
        }

        match state.objects.get_mut(&(resource.kind.clone(), key.clone())) {
            Some(entry) if entry.hidden_reads > 0 => {
                entry.hidden_reads -= 1;
                trace!(kind = %resource.kind, object = %key, "read hidden by propagation lag");
                Err(Error::not_found(&resource.kind, &key.namespace, &key.name))
            }
            Some(entry) => Ok(entry.object.clone()),
            None => Err(Error::not_found(&resource.kind, &key.namespace, &key.name)),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let mut state = self.lock()?;
        let any_key = ObjectKey::new(namespace, "");
        if let Some(fault) = state.take_fault(StoreOp::List, &resource.kind) {
            return Err(fault_error(fault, resource, &any_key));
        }

        Ok(state
            .objects
            .iter()
            .filter(|((kind, key), entry)| {
                *kind == resource.kind && key.namespace == namespace && entry.hidden_reads == 0
            })
            .map(|(_, entry)| entry.object.clone())
            .collect())
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = key_of(object)?;
        let mut state = self.lock()?;
        if let Some(fault) = state.take_fault(StoreOp::Create, &resource.kind) {
            return Err(fault_error(fault, resource, &key));
        }

        let id = (resource.kind.clone(), key.clone());
        if state.objects.contains_key(&id) {
            return Err(Error::already_exists(
                &resource.kind,
                &key.namespace,
                &key.name,
            ));
        }

        let mut stored = object.clone();
        stored.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        state.next_uid += 1;
        stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
        stored.metadata.resource_version = Some(state.bump_version());
        stored.metadata.generation = Some(1);

        state.objects.insert(
            id,
            Entry {
                object: stored.clone(),
                hidden_reads: self.read_lag,
            },
        );
        state.record_write(&resource.kind);
        drop(state);

        self.publish(&resource.kind, &key, false, stored.metadata.generation);
        Ok(stored)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = key_of(object)?;
        let mut state = self.lock()?;
        if let Some(fault) = state.take_fault(StoreOp::Replace, &resource.kind) {
            return Err(fault_error(fault, resource, &key));
        }

        let id = (resource.kind.clone(), key.clone());
        let current = match state.objects.get(&id) {
            Some(entry) => entry.object.clone(),
            None => {
                return Err(Error::not_found(&resource.kind, &key.namespace, &key.name));
            }
        };

        if let Some(version) = &object.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(version) {
                return Err(Error::conflict(
                    &resource.kind,
                    &key.namespace,
                    &key.name,
                    format!(
                        "resourceVersion {} is stale, current is {}",
                        version,
                        current.metadata.resource_version.as_deref().unwrap_or("none")
                    ),
                ));
            }
        }

        let mut stored = object.clone();
        stored.types = current.types.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        // Status only changes through the status subresource
        if let Some(map) = stored.data.as_object_mut() {
            match current.data.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = if spec_fields(&stored) != spec_fields(&current) {
            Some(generation + 1)
        } else {
            Some(generation)
        };
        stored.metadata.resource_version = Some(state.bump_version());

        if let Some(entry) = state.objects.get_mut(&id) {
            entry.object = stored.clone();
            entry.hidden_reads = 0;
        }
        state.record_write(&resource.kind);
        drop(state);

        self.publish(&resource.kind, &key, false, stored.metadata.generation);
        Ok(stored)
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), Error> {
        let mut state = self.lock()?;
        if let Some(fault) = state.take_fault(StoreOp::Delete, &resource.kind) {
            return Err(fault_error(fault, resource, key));
        }

        let root = state
            .objects
            .remove(&(resource.kind.clone(), key.clone()))
            .ok_or_else(|| Error::not_found(&resource.kind, &key.namespace, &key.name))?;
        state.record_write(&resource.kind);

        let mut removed = vec![(resource.kind.clone(), key.clone())];
        let mut orphaned_uids: Vec<String> = root.object.metadata.uid.into_iter().collect();

        // Garbage collection: remove dependents of every removed object
        while let Some(uid) = orphaned_uids.pop() {
            let dependents: Vec<(String, ObjectKey)> = state
                .objects
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .object
                        .metadata
                        .owner_references
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .any(|r| r.uid == uid)
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in dependents {
                if let Some(entry) = state.objects.remove(&id) {
                    trace!(kind = %id.0, object = %id.1, owner_uid = %uid, "collected dependent");
                    orphaned_uids.extend(entry.object.metadata.uid);
                    removed.push(id);
                }
            }
        }
        drop(state);

        for (kind, key) in &removed {
            self.publish(kind, key, true, None);
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut state = self.lock()?;
        if let Some(fault) = state.take_fault(StoreOp::PatchStatus, &resource.kind) {
            return Err(fault_error(fault, resource, key));
        }

        let version = state.bump_version();
        let entry = state
            .objects
            .get_mut(&(resource.kind.clone(), key.clone()))
            .ok_or_else(|| Error::not_found(&resource.kind, &key.namespace, &key.name))?;

        if !entry.object.data.is_object() {
            entry.object.data = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = entry.object.data.as_object_mut() {
            let current = map
                .entry("status".to_string())
                .or_insert(serde_json::Value::Null);
            merge_patch(current, status);
        }
        entry.object.metadata.resource_version = Some(version);
        let generation = entry.object.metadata.generation;
        state.record_write(&resource.kind);
        drop(state);

        self.publish(&resource.kind, key, false, generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{api_resource, from_dynamic, to_dynamic};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn secret(name: &str, owner_uid: Option<&str>) -> DynamicObject {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner_uid.map(|uid| {
                    vec![OwnerReference {
                        api_version: "v1".to_string(),
                        kind: "Secret".to_string(),
                        name: "owner".to_string(),
                        uid: uid.to_string(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        to_dynamic(&secret).unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_version() {
        let store = MemoryStore::new();
        let created = store
            .create(&api_resource::<Secret>(), &secret("web", None))
            .await
            .unwrap();

        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        store.create(&resource, &secret("web", None)).await.unwrap();

        let err = store.create(&resource, &secret("web", None)).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.count("Secret"), 1);
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        let first = store.create(&resource, &secret("web", None)).await.unwrap();

        let mut winner = first.clone();
        winner.data["type"] = serde_json::json!("kubernetes.io/tls");
        store.replace(&resource, &winner).await.unwrap();

        let mut loser = first;
        loser.data["type"] = serde_json::json!("Opaque-2");
        let err = store.replace(&resource, &loser).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_replace_bumps_generation_only_on_change() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        let created = store.create(&resource, &secret("web", None)).await.unwrap();

        let same = store.replace(&resource, &created).await.unwrap();
        assert_eq!(same.metadata.generation, Some(1));

        let mut changed = same.clone();
        changed.data["type"] = serde_json::json!("kubernetes.io/tls");
        let changed = store.replace(&resource, &changed).await.unwrap();
        assert_eq!(changed.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn story_new_object_is_invisible_until_propagated() {
        let store = MemoryStore::new().with_read_lag(2);
        let resource = api_resource::<Secret>();
        let key = ObjectKey::new("default", "web");
        store.create(&resource, &secret("web", None)).await.unwrap();

        assert!(store.list(&resource, "default").await.unwrap().is_empty());
        assert!(store.get(&resource, &key).await.unwrap_err().is_not_found());
        assert!(store.get(&resource, &key).await.unwrap_err().is_not_found());
        assert!(store.get(&resource, &key).await.is_ok());
        assert_eq!(store.list(&resource, "default").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn story_deleting_an_owner_collects_its_dependents() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        let owner = store.create(&resource, &secret("owner", None)).await.unwrap();
        let owner_uid = owner.metadata.uid.clone().unwrap();

        let child = store
            .create(&resource, &secret("child", Some(&owner_uid)))
            .await
            .unwrap();
        let child_uid = child.metadata.uid.clone().unwrap();
        store
            .create(&resource, &secret("grandchild", Some(&child_uid)))
            .await
            .unwrap();
        store.create(&resource, &secret("bystander", None)).await.unwrap();

        let mut events = store.subscribe();
        store
            .delete(&resource, &ObjectKey::new("default", "owner"))
            .await
            .unwrap();

        let remaining = store.list(&resource, "default").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name.as_deref(), Some("bystander"));

        let mut deleted = vec![];
        while let Ok(event) = events.try_recv() {
            assert!(event.deleted);
            deleted.push(event.key.name);
        }
        assert_eq!(deleted, vec!["owner", "child", "grandchild"]);
    }

    #[tokio::test]
    async fn test_status_patch_merges_and_survives_replace() {
        let store = MemoryStore::new();
        let resource = api_resource::<Deployment>();
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        store
            .create(&resource, &to_dynamic(&deployment).unwrap())
            .await
            .unwrap();

        let key = ObjectKey::new("default", "web");
        store
            .patch_status(&resource, &key, &serde_json::json!({"replicas": 1}))
            .await
            .unwrap();
        store
            .patch_status(&resource, &key, &serde_json::json!({"readyReplicas": 1}))
            .await
            .unwrap();

        let current = store.get(&resource, &key).await.unwrap();
        store.replace(&resource, &current).await.unwrap();

        let read: Deployment = from_dynamic(&store.get(&resource, &key).await.unwrap()).unwrap();
        let status = read.status.unwrap();
        assert_eq!(status.replicas, Some(1));
        assert_eq!(status.ready_replicas, Some(1));
    }

    #[tokio::test]
    async fn test_status_patch_event_keeps_generation() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        store.create(&resource, &secret("web", None)).await.unwrap();

        let mut events = store.subscribe();
        let key = ObjectKey::new("default", "web");
        store
            .patch_status(&resource, &key, &serde_json::json!({"observed": true}))
            .await
            .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.generation, Some(1));
        assert!(!event.deleted);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        let resource = api_resource::<Secret>();
        store.inject(StoreOp::Create, "Secret", Fault::Unavailable, 1);

        assert!(store.create(&resource, &secret("web", None)).await.is_err());
        assert!(store.create(&resource, &secret("web", None)).await.is_ok());
        assert_eq!(store.writes_for("Secret"), 1);
    }
}
