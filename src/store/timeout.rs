//! Per-request deadline decorator for any ObjectStore

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use super::{ObjectKey, ObjectStore};
use crate::Error;

/// Bounds every call on the wrapped store by `timeout`.
///
/// An elapsed deadline surfaces as [`Error::Timeout`], which the controller
/// treats as transient.
pub struct TimeoutStore {
    inner: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl TimeoutStore {
    /// Wrap `inner` with a per-request deadline
    pub fn new(inner: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: impl FnOnce() -> String,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation(), self.timeout)),
        }
    }
}

#[async_trait]
impl ObjectStore for TimeoutStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, Error> {
        self.bounded(
            || format!("get {} {}", resource.kind, key),
            self.inner.get(resource, key),
        )
        .await
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        self.bounded(
            || format!("list {} in {}", resource.kind, namespace),
            self.inner.list(resource, namespace),
        )
        .await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        self.bounded(
            || format!("create {} {}", resource.kind, object_name(object)),
            self.inner.create(resource, object),
        )
        .await
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        self.bounded(
            || format!("replace {} {}", resource.kind, object_name(object)),
            self.inner.replace(resource, object),
        )
        .await
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), Error> {
        self.bounded(
            || format!("delete {} {}", resource.kind, key),
            self.inner.delete(resource, key),
        )
        .await
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        self.bounded(
            || format!("patch status of {} {}", resource.kind, key),
            self.inner.patch_status(resource, key, status),
        )
        .await
    }
}

fn object_name(object: &DynamicObject) -> &str {
    object.metadata.name.as_deref().unwrap_or("<unnamed>")
}
