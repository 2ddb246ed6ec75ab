//! Instance reconciler
//!
//! Converges one instance of a watched kind:
//! - Finalizer attached before any external side effect
//! - Instance rendered through ytt
//! - Rendered objects linked to the instance by owner reference
//! - Rendered stream deployed with kapp as one application
//!
//! Deletion runs the mirror image: kapp delete, then finalizer release.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::finalizer::FinalizerGate;
use crate::manifests::{
    controller_reference, create_or_update, decode_manifests, set_controller_reference,
    validate_owner_scope,
};
use crate::metrics;
use crate::store::{type_meta, ObjectRef, ResourceStore};
use crate::tools::{Application, ConvergenceTool, TemplateEngine};

/// Reconciles every instance of one kind
pub struct InstanceReconciler {
    store: Arc<dyn ResourceStore>,
    engine: Arc<dyn TemplateEngine>,
    tool: Arc<dyn ConvergenceTool>,
    gate: FinalizerGate,
    gvk: GroupVersionKind,
}

impl InstanceReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        engine: Arc<dyn TemplateEngine>,
        tool: Arc<dyn ConvergenceTool>,
        gvk: GroupVersionKind,
    ) -> Self {
        Self {
            store,
            engine,
            tool,
            gate: FinalizerGate::default(),
            gvk,
        }
    }

    /// The kind this reconciler handles
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Reconcile the instance with the given namespace and name.
    ///
    /// Everything is derived from the instance as currently stored, so a
    /// repeated or coalesced event converges to the same result.
    pub async fn reconcile(&self, namespace: Option<&str>, name: &str) -> Result<Action> {
        let key = ObjectRef::new(self.gvk.clone(), namespace.map(str::to_string), name);

        let Some(instance) = self.store.get(&key).await? else {
            debug!(object = %key, "Instance is gone, nothing to reconcile");
            return Ok(Action::await_change());
        };

        let app = Application::for_instance(&instance);
        if instance.metadata.deletion_timestamp.is_some() {
            return self.cleanup(&key, &instance, &app).await;
        }

        let instance = self
            .gate
            .ensure_present(self.store.as_ref(), &key, &instance)
            .await?;
        self.apply(&key, &instance, &app).await
    }

    async fn apply(
        &self,
        key: &ObjectRef,
        instance: &DynamicObject,
        app: &Application,
    ) -> Result<Action> {
        info!(object = %key, app = %app, "Reconciling instance");

        let mut document = instance.clone();
        if document.types.is_none() {
            document.types = Some(type_meta(&self.gvk));
        }
        let instance_yaml = serde_yaml::to_string(&document)?;

        let rendered = self.engine.render(&instance_yaml).await?;

        // Decode and scope-check the whole stream first: a single bad
        // document must keep every object of this render out of the store.
        let mut objects = decode_manifests(&rendered)?;
        for obj in &mut objects {
            let child = ObjectRef::from_object(obj)?;
            if !self.store.is_namespaced(&child.gvk).await? {
                obj.metadata.namespace = None;
            } else if obj.metadata.namespace.is_none() {
                obj.metadata.namespace = instance.namespace();
            }
            validate_owner_scope(instance, obj)?;
        }
        let reference = controller_reference(instance, &self.gvk)?;

        for obj in objects {
            let kind = obj
                .types
                .as_ref()
                .map(|t| t.kind.clone())
                .unwrap_or_default();

            let result = create_or_update(self.store.as_ref(), obj, |o| {
                set_controller_reference(o, reference.clone())
            })
            .await?;

            metrics::DERIVED_OBJECTS
                .with_label_values(&[kind.as_str(), result.as_str()])
                .inc();
        }

        self.tool.deploy(app, &rendered).await?;

        info!(object = %key, app = %app, "Instance reconciled");
        Ok(Action::await_change())
    }

    async fn cleanup(
        &self,
        key: &ObjectRef,
        instance: &DynamicObject,
        app: &Application,
    ) -> Result<Action> {
        info!(object = %key, app = %app, "Tearing down instance");

        match self.tool.delete(app).await {
            Ok(()) => {}
            Err(Error::ApplicationNotFound(_)) => {
                info!(app = %app, "Application already removed");
            }
            Err(e) => return Err(e),
        }

        self.gate.ensure_absent(self.store.as_ref(), key, instance).await?;
        metrics::CLEANUPS.with_label_values(&[self.gvk.kind.as_str()]).inc();

        Ok(Action::await_change())
    }
}
