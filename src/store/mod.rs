//! Object store boundary
//!
//! The controller talks to the cluster only through [`ObjectStore`], an
//! untyped get/list/create/replace/delete/patch-status interface over
//! `DynamicObject` with an explicit `ApiResource`. Writes are version-checked:
//! `replace` carries the observed `resourceVersion` and fails with
//! [`Error::Conflict`] when it is stale.
//!
//! Implementations:
//! - [`KubeStore`]: kube-rs client against a real API server
//! - [`TimeoutStore`]: decorator bounding every call by a deadline
//! - [`MemoryStore`]: in-process store with propagation delay and owner GC

mod kube_store;
mod memory;
mod timeout;

use std::fmt;

use async_trait::async_trait;
use kube::api::{DynamicObject, Resource};
use kube::discovery::ApiResource;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub use kube_store::KubeStore;
pub use memory::{Fault, MemoryStore, StoreEvent, StoreOp};
pub use timeout::TimeoutStore;

/// Namespace + name identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object, if it carries both namespace and name
    pub fn from_meta(meta: &kube::api::ObjectMeta) -> Option<Self> {
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Untyped access to the cluster's object store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one object; absence is [`Error::NotFound`]
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, Error>;

    /// List all objects of a kind in a namespace
    async fn list(&self, resource: &ApiResource, namespace: &str)
        -> Result<Vec<DynamicObject>, Error>;

    /// Create an object; an existing identity is [`Error::AlreadyExists`]
    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Replace an object, checking `metadata.resourceVersion`
    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object; dependents are left to the store's garbage collector
    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), Error>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// `ApiResource` of a statically typed resource
pub fn api_resource<K>() -> ApiResource
where
    K: Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

/// Convert a typed object into its untyped form
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, Error> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert an untyped object into a typed one
pub fn from_dynamic<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, Error> {
    let value = serde_json::to_value(object)?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization(format!("decoding {}: {}", display_kind(object), e)))
}

fn display_kind(object: &DynamicObject) -> String {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or("object");
    let name = object.metadata.name.as_deref().unwrap_or("<unnamed>");
    format!("{} {}", kind, name)
}

/// Read a typed object
pub async fn get_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let object = store.get(&api_resource::<K>(), key).await?;
    from_dynamic(&object)
}

/// List typed objects in a namespace
pub async fn list_typed<K>(store: &dyn ObjectStore, namespace: &str) -> Result<Vec<K>, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&api_resource::<K>(), namespace)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}

/// Create a typed object
pub async fn create_typed<K>(store: &dyn ObjectStore, object: &K) -> Result<K, Error>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let created = store
        .create(&api_resource::<K>(), &to_dynamic(object)?)
        .await?;
    from_dynamic(&created)
}

/// Delete a typed object
pub async fn delete_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<(), Error>
where
    K: Resource<DynamicType = ()>,
{
    store.delete(&api_resource::<K>(), key).await
}
