//! Worker provisioning
//!
//! Every Reconciler gets one worker Deployment running this same binary
//! with `--reconciler-name=<name>`. The worker's pod template is cloned from
//! the pod the provisioner itself runs in.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{validate_reconciler, Reconciler};
use crate::error::{Error, Result};
use crate::finalizer::FinalizerGate;
use crate::manifests::create_or_update;
use crate::metrics;
use crate::store::{from_dynamic, to_dynamic, ObjectRef, ResourceStore};

/// Flag binding a worker process to its Reconciler
pub const RECONCILER_NAME_FLAG: &str = "--reconciler-name";

/// Label carrying the owning Reconciler's name
pub const RECONCILER_LABEL: &str = "ytt-operator.io/reconciler";

/// Pod template annotation recording the Reconciler generation a worker
/// was started for. A new generation rolls the worker, which loads its
/// scripts and kinds only at startup.
pub const GENERATION_ANNOTATION: &str = "ytt-operator.io/reconciler-generation";

/// Name of the worker Deployment for a Reconciler
pub fn worker_name(reconciler_name: &str) -> String {
    format!("ytt-operator-{}", reconciler_name)
}

/// Selector labels of the worker for a Reconciler
pub fn worker_labels(reconciler_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), worker_name(reconciler_name))])
}

/// Container arguments for a worker: any previous binding is dropped and
/// exactly one `--reconciler-name=<name>` is appended.
pub fn worker_args(args: &[String], reconciler_name: &str) -> Vec<String> {
    let prefix = format!("{}=", RECONCILER_NAME_FLAG);
    let mut out = Vec::with_capacity(args.len() + 1);
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == RECONCILER_NAME_FLAG {
            skip_value = true;
            continue;
        }
        if arg.starts_with(&prefix) {
            continue;
        }
        out.push(arg.clone());
    }
    out.push(format!("{}{}", prefix, reconciler_name));
    out
}

/// The pod the provisioner runs in, used as the template for every worker
#[derive(Clone, Debug)]
pub struct ParentTemplate {
    namespace: String,
    spec: PodSpec,
    container: String,
}

impl ParentTemplate {
    /// Template from a pod spec. `container` names the container that runs
    /// the operator binary.
    pub fn new(
        namespace: impl Into<String>,
        spec: PodSpec,
        container: impl Into<String>,
    ) -> Result<Self> {
        let container = container.into();
        if !spec.containers.iter().any(|c| c.name == container) {
            return Err(Error::config(format!(
                "Parent pod has no container named '{}'",
                container
            )));
        }
        Ok(Self {
            namespace: namespace.into(),
            spec,
            container,
        })
    }

    /// Template from the running parent pod
    pub fn from_pod(pod: Pod, container: impl Into<String>) -> Result<Self> {
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::config("Parent pod has no namespace"))?;
        let spec = pod
            .spec
            .ok_or_else(|| Error::config("Parent pod has no spec"))?;
        Self::new(namespace, spec, container)
    }

    /// Namespace the workers are created in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pod template for the worker of a Reconciler
    pub fn pod_template(&self, reconciler: &Reconciler) -> Result<PodTemplateSpec> {
        let name = reconciler.name_any();
        let mut spec = self.spec.clone();
        spec.node_name = None;

        if let Some(sa) = &reconciler.spec.service_account_name {
            spec.service_account_name = Some(sa.clone());
            spec.service_account = None;
        }

        let container = spec
            .containers
            .iter_mut()
            .find(|c| c.name == self.container)
            .ok_or_else(|| {
                Error::config(format!("Parent pod has no container named '{}'", self.container))
            })?;
        container.args = Some(worker_args(
            container.args.as_deref().unwrap_or_default(),
            &name,
        ));

        let mut labels = worker_labels(&name);
        labels.insert(RECONCILER_LABEL.to_string(), name);

        let annotations = reconciler.metadata.generation.map(|generation| {
            BTreeMap::from([(GENERATION_ANNOTATION.to_string(), generation.to_string())])
        });

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations,
                ..Default::default()
            }),
            spec: Some(spec),
        })
    }

    /// Bring a worker Deployment in line with a Reconciler.
    ///
    /// Only the fields set here are touched; anything else on a stored
    /// Deployment is left alone.
    pub fn mutate_deployment(
        &self,
        deployment: &mut Deployment,
        reconciler: &Reconciler,
    ) -> Result<()> {
        let name = reconciler.name_any();

        let labels = deployment.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.extend(worker_labels(&name));
        labels.insert(RECONCILER_LABEL.to_string(), name.clone());

        if reconciler.namespace().as_deref() == Some(self.namespace.as_str()) {
            let reference = reconciler.controller_owner_ref(&()).ok_or_else(|| {
                Error::validation(format!("Reconciler '{}' has no uid", name))
            })?;
            let refs = deployment.metadata.owner_references.get_or_insert_with(Vec::new);
            match refs.iter_mut().find(|r| r.uid == reference.uid) {
                Some(existing) => *existing = reference,
                None => refs.push(reference),
            }
        }

        let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);
        spec.replicas = Some(1);
        spec.selector = LabelSelector {
            match_labels: Some(worker_labels(&name)),
            ..Default::default()
        };
        spec.template = self.pod_template(reconciler)?;
        Ok(())
    }
}

/// Converges one worker Deployment per Reconciler
pub struct WorkerProvisioner {
    store: Arc<dyn ResourceStore>,
    gate: FinalizerGate,
    parent: ParentTemplate,
}

impl WorkerProvisioner {
    pub fn new(store: Arc<dyn ResourceStore>, parent: ParentTemplate) -> Self {
        Self {
            store,
            gate: FinalizerGate::default(),
            parent,
        }
    }

    pub fn parent(&self) -> &ParentTemplate {
        &self.parent
    }

    /// Reference to the worker Deployment of a Reconciler
    pub fn worker_ref(&self, reconciler_name: &str) -> ObjectRef {
        ObjectRef::new(
            GroupVersionKind::gvk("apps", "v1", "Deployment"),
            Some(self.parent.namespace.clone()),
            worker_name(reconciler_name),
        )
    }

    /// Reconcile the Reconciler with the given namespace and name
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let key = ObjectRef::new(Reconciler::gvk(), Some(namespace.to_string()), name);

        let Some(obj) = self.store.get(&key).await? else {
            debug!(object = %key, "Reconciler is gone, nothing to reconcile");
            return Ok(Action::await_change());
        };

        if obj.metadata.deletion_timestamp.is_some() {
            info!(object = %key, "Tearing down worker");
            let worker = self.worker_ref(name);
            if !self.store.delete(&worker).await? {
                info!(worker = %worker, "Worker already removed");
            }
            self.gate
                .ensure_absent(self.store.as_ref(), &key, &obj)
                .await?;
            metrics::CLEANUPS.with_label_values(&["Reconciler"]).inc();
            return Ok(Action::await_change());
        }

        let reconciler: Reconciler = from_dynamic(&obj)?;
        if let Err(e) = validate_reconciler(&reconciler) {
            warn!(object = %key, error = %e, "Invalid Reconciler, not provisioning a worker");
            return Err(e);
        }

        let obj = self
            .gate
            .ensure_present(self.store.as_ref(), &key, &obj)
            .await?;
        let reconciler: Reconciler = from_dynamic(&obj)?;

        let desired = Deployment {
            metadata: ObjectMeta {
                name: Some(worker_name(name)),
                namespace: Some(self.parent.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = create_or_update(self.store.as_ref(), to_dynamic(&desired)?, |o| {
            let mut deployment: Deployment = from_dynamic(o)?;
            self.parent.mutate_deployment(&mut deployment, &reconciler)?;
            *o = to_dynamic(&deployment)?;
            Ok(())
        })
        .await?;

        metrics::DERIVED_OBJECTS
            .with_label_values(&["Deployment", result.as_str()])
            .inc();
        info!(
            object = %key,
            worker = %worker_name(name),
            result = result.as_str(),
            "Worker converged"
        );

        Ok(Action::await_change())
    }
}
