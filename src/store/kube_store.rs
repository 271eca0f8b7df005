//! ObjectStore backed by a kube-rs client

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use super::{ObjectKey, ObjectStore};
use crate::{Error, FIELD_MANAGER};

/// Real Kubernetes object store
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Translate API status codes into the store's error vocabulary
fn map_api_error(err: kube::Error, resource: &ApiResource, namespace: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::not_found(&resource.kind, namespace, name)
        }
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::already_exists(&resource.kind, namespace, name)
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::conflict(&resource.kind, namespace, name, resp.message.clone())
        }
        _ => Error::Kube(err),
    }
}

fn object_identity(object: &DynamicObject) -> Result<ObjectKey, Error> {
    ObjectKey::from_meta(&object.metadata)
        .ok_or_else(|| Error::internal("object is missing metadata.name or metadata.namespace"))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, Error> {
        self.api(resource, &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_api_error(e, resource, &key.namespace, &key.name))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let list = self
            .api(resource, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_api_error(e, resource, namespace, ""))?;
        Ok(list.items)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = object_identity(object)?;
        debug!(kind = %resource.kind, object = %key, "creating object");
        self.api(resource, &key.namespace)
            .create(&Self::post_params(), object)
            .await
            .map_err(|e| map_api_error(e, resource, &key.namespace, &key.name))
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let key = object_identity(object)?;
        debug!(
            kind = %resource.kind,
            object = %key,
            resource_version = ?object.metadata.resource_version,
            "replacing object"
        );
        self.api(resource, &key.namespace)
            .replace(&key.name, &Self::post_params(), object)
            .await
            .map_err(|e| map_api_error(e, resource, &key.namespace, &key.name))
    }

    async fn delete(&self, resource: &ApiResource, key: &ObjectKey) -> Result<(), Error> {
        self.api(resource, &key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| map_api_error(e, resource, &key.namespace, &key.name))?;
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api(resource, &key.namespace)
            .patch_status(
                &key.name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(&status_patch),
            )
            .await
            .map_err(|e| map_api_error(e, resource, &key.namespace, &key.name))?;

        Ok(())
    }
}
