//! Access to the declarative resource store
//!
//! Reconcilers only talk to the store through [`ResourceStore`], which works
//! on untyped [`DynamicObject`]s so that kinds chosen at runtime are handled
//! the same way as compiled-in ones. [`KubeStore`] is backed by the API
//! server, [`MemoryStore`] keeps everything in process.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use std::fmt;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::gvk_from_api_version;
use crate::error::{Error, Result};

/// Identifies one object in the store
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(gvk: GroupVersionKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace,
            name: name.into(),
        }
    }

    /// Build the reference for an object carrying its own type information
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::malformed(format!("object '{}' has no apiVersion/kind", obj.name_any()))
        })?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(Error::malformed(format!(
                "object '{}' has an unresolvable kind",
                obj.name_any()
            )));
        }
        Ok(Self::new(
            gvk_from_api_version(&types.api_version, &types.kind),
            obj.namespace(),
            obj.name_any(),
        ))
    }

    pub fn api_version(&self) -> String {
        api_version(&self.gvk)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk.kind, ns, self.name),
            None => write!(f, "{} {}", self.gvk.kind, self.name),
        }
    }
}

/// Render the apiVersion string for a group/version/kind
pub fn api_version(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Type metadata for a group/version/kind
pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta {
        api_version: api_version(gvk),
        kind: gvk.kind.clone(),
    }
}

/// Convert a typed resource into its untyped form
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert an untyped object into a typed resource
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Get/create/update/patch/delete by namespaced name
///
/// Writes are guarded by resource version: a stale `resourceVersion` in a
/// replace or merge patch yields [`Error::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object; a missing object is `Ok(None)`
    async fn get(&self, key: &ObjectRef) -> Result<Option<DynamicObject>>;

    /// Create a new object
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch
    async fn patch_merge(&self, key: &ObjectRef, patch: &serde_json::Value)
        -> Result<DynamicObject>;

    /// Delete an object; returns false when it did not exist
    async fn delete(&self, key: &ObjectRef) -> Result<bool>;

    /// Whether objects of a kind live in a namespace
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool>;
}
