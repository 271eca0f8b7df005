//! Ownership linking between an Application and its derived objects
//!
//! Every derived object carries a controller owner reference to the
//! Application, so deleting the Application lets the store's garbage
//! collector remove everything it produced.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use crate::crd::Application;
use crate::Error;

/// Identity of the controlling owner stamped onto derived objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerLink {
    /// Owner apiVersion
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner UID
    pub uid: String,
}

impl OwnerLink {
    /// Build the owner identity of an Application.
    ///
    /// Fails when the Application has not been persisted yet (no UID).
    pub fn for_application(app: &Application) -> Result<Self, Error> {
        let name = app
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("application has no metadata.name"))?;
        let uid = app.metadata.uid.clone().ok_or_else(|| {
            Error::validation(format!("application '{}' has no uid", name))
        })?;

        Ok(Self {
            api_version: Application::api_version(&()).to_string(),
            kind: Application::kind(&()).to_string(),
            name,
            uid,
        })
    }

    /// Human-readable owner reference, e.g. `Application/inventory`
    pub fn display(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    fn to_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Stamp `owner` as the controller of `meta`.
///
/// Returns `true` when the owner references changed. Re-linking an object
/// that already carries the identical reference is a no-op.
pub fn link(meta: &mut ObjectMeta, owner: &OwnerLink) -> bool {
    let reference = owner.to_reference();
    let refs = meta.owner_references.get_or_insert_with(Vec::new);

    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) if *existing == reference => false,
        Some(existing) => {
            *existing = reference;
            true
        }
        None => {
            refs.push(reference);
            true
        }
    }
}

/// UID of the object's controlling owner, if any
pub fn controller_uid(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.as_str())
}

/// True when the object is controlled by the owner with `uid`
pub fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_uid(meta) == Some(uid)
}
