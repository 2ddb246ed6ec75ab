//! Finalizer management
//!
//! Every reconciler attaches the operator finalizer before it causes any
//! external side effect and removes it only once teardown succeeded.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::store::{ObjectRef, ResourceStore};

/// Finalizer placed on every object the operator manages
pub const DEFAULT_FINALIZER: &str = "ytt-operator.io/finalizer";

/// Idempotent add/remove of the operator finalizer
///
/// Changes are written as a merge patch computed from a clone of the
/// observed object, carrying its `resourceVersion` so that a concurrent
/// writer surfaces as [`crate::Error::Conflict`] instead of a lost update.
#[derive(Clone, Debug)]
pub struct FinalizerGate {
    name: String,
}

impl Default for FinalizerGate {
    fn default() -> Self {
        Self::new(DEFAULT_FINALIZER)
    }
}

impl FinalizerGate {
    /// Gate for a custom finalizer name (tests only; the operator uses the default)
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Whether the object carries the finalizer
    pub fn is_present(&self, obj: &DynamicObject) -> bool {
        obj.finalizers().iter().any(|f| f == &self.name)
    }

    /// Add the finalizer unless already present.
    /// Returns the object as stored after the call.
    pub async fn ensure_present(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectRef,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        if self.is_present(obj) {
            return Ok(obj.clone());
        }

        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(self.name.clone());

        debug!(object = %key, finalizer = %self.name, "Adding finalizer");
        self.write(store, key, obj, finalizers).await
    }

    /// Remove the finalizer if present.
    /// Returns `None` when the store erased the object as a result.
    pub async fn ensure_absent(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectRef,
        obj: &DynamicObject,
    ) -> Result<Option<DynamicObject>> {
        if !self.is_present(obj) {
            return Ok(Some(obj.clone()));
        }

        let finalizers: Vec<String> = obj
            .finalizers()
            .iter()
            .filter(|f| *f != &self.name)
            .cloned()
            .collect();

        debug!(object = %key, finalizer = %self.name, "Removing finalizer");
        let patched = self.write(store, key, obj, finalizers).await?;
        if patched.metadata.deletion_timestamp.is_some() && patched.finalizers().is_empty() {
            return Ok(None);
        }
        Ok(Some(patched))
    }

    async fn write(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectRef,
        obj: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<DynamicObject> {
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.resource_version(),
                "finalizers": finalizers,
            }
        });
        store.patch_merge(key, &patch).await
    }
}
