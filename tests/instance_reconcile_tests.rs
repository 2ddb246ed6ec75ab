//! Integration tests for the instance reconciler
//!
//! These tests drive the reconciler against the in-memory store with a
//! fake template engine and a fake convergence tool.

mod common;

use std::sync::Arc;

use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use ytt_operator::finalizer::DEFAULT_FINALIZER;
use ytt_operator::reconcilers::InstanceReconciler;
use ytt_operator::store::{MemoryStore, ObjectRef, ResourceStore};
use ytt_operator::Error;

use common::{widget, widget_gvk, DeleteOutcome, FakeEngine, FakeTool};

const RENDERED: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: w-config
data:
  size: \"3\"
---
apiVersion: v1
kind: Service
metadata:
  name: w-svc
  namespace: default
spec:
  ports:
  - port: 80
";

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    store: Arc<MemoryStore>,
    engine: Arc<FakeEngine>,
    tool: Arc<FakeTool>,
    reconciler: InstanceReconciler,
}

fn harness(rendered: &str) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(FakeEngine::new(rendered));
    let tool = Arc::new(FakeTool::new());
    let reconciler = InstanceReconciler::new(
        store.clone(),
        engine.clone(),
        tool.clone(),
        widget_gvk(),
    );
    Harness {
        store,
        engine,
        tool,
        reconciler,
    }
}

fn instance_key() -> ObjectRef {
    ObjectRef::new(widget_gvk(), Some("default".to_string()), "w")
}

fn config_map_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

fn service_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Service")
}

async fn seeded(rendered: &str) -> Harness {
    let h = harness(rendered);
    h.store.create(&widget("w", "default")).await.unwrap();
    h
}

// ============================================================================
// Apply Path
// ============================================================================

#[tokio::test]
async fn missing_instance_is_not_an_error() {
    let h = harness(RENDERED);

    let action = h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(h.engine.inputs().is_empty());
    assert_eq!(h.tool.deploy_count(), 0);
}

#[tokio::test]
async fn finalizer_is_recorded_before_rendering() {
    let h = seeded(RENDERED).await;

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    let stored = h.store.get(&instance_key()).await.unwrap().unwrap();
    assert_eq!(stored.finalizers(), [DEFAULT_FINALIZER.to_string()]);

    let inputs = h.engine.inputs();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].contains(DEFAULT_FINALIZER));
    assert!(inputs[0].contains("kind: Widget"));
}

#[tokio::test]
async fn derived_objects_are_owned_by_the_instance() {
    let h = seeded(RENDERED).await;

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    let instance = h.store.get(&instance_key()).await.unwrap().unwrap();
    let config_maps = h.store.list(&config_map_gvk());
    assert_eq!(config_maps.len(), 1);
    assert_eq!(config_maps[0].namespace().as_deref(), Some("default"));

    for obj in config_maps.iter().chain(h.store.list(&service_gvk()).iter()) {
        let refs = obj.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, instance.uid().unwrap());
        assert_eq!(refs[0].kind, "Widget");
        assert_eq!(refs[0].controller, Some(true));
    }
}

#[tokio::test]
async fn whole_stream_is_deployed_as_one_application() {
    let h = seeded(RENDERED).await;

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    let deploys = h.tool.deploys.lock().unwrap().clone();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].0.name, "w");
    assert_eq!(deploys[0].0.namespace.as_deref(), Some("default"));
    assert_eq!(deploys[0].1, RENDERED.as_bytes());
}

#[tokio::test]
async fn repeated_reconciles_converge_without_extra_writes() {
    let h = seeded(RENDERED).await;

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    let writes = h.store.writes();

    for _ in 0..3 {
        let action = h.reconciler.reconcile(Some("default"), "w").await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    assert_eq!(h.store.writes(), writes);
    assert_eq!(h.store.list(&config_map_gvk()).len(), 1);
    assert_eq!(h.store.list(&service_gvk()).len(), 1);
    assert_eq!(
        h.store.list(&config_map_gvk())[0].owner_references().len(),
        1
    );
}

#[tokio::test]
async fn empty_render_still_deploys() {
    let h = seeded("").await;

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert_eq!(h.tool.deploy_count(), 1);
    assert!(h.store.list(&config_map_gvk()).is_empty());
}

#[tokio::test]
async fn malformed_stream_applies_nothing() {
    let rendered = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: w-config
---
apiVersion: v1
kind: \"\"
metadata:
  name: broken
";
    let h = seeded(rendered).await;

    let err = h
        .reconciler
        .reconcile(Some("default"), "w")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedOutput(_)));
    assert!(h.store.list(&config_map_gvk()).is_empty());
    assert_eq!(h.tool.deploy_count(), 0);
}

#[tokio::test]
async fn objects_owned_by_someone_else_are_not_taken_over() {
    let h = seeded(RENDERED).await;
    let foreign = h.store.create(&widget("other", "default")).await.unwrap();

    let taken: kube::api::DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "w-config",
            "namespace": "default",
            "ownerReferences": [{
                "apiVersion": "example.com/v1",
                "kind": "Widget",
                "name": "other",
                "uid": foreign.uid().unwrap(),
                "controller": true
            }]
        }
    }))
    .unwrap();
    h.store.create(&taken).await.unwrap();

    let err = h
        .reconciler
        .reconcile(Some("default"), "w")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOwned { .. }));
    assert_eq!(h.tool.deploy_count(), 0);
}

#[tokio::test]
async fn objects_in_another_namespace_are_rejected() {
    let rendered = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: w-config
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: elsewhere
  namespace: other
";
    let h = seeded(rendered).await;

    let err = h
        .reconciler
        .reconcile(Some("default"), "w")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(h.store.list(&config_map_gvk()).is_empty());
    assert_eq!(h.tool.deploy_count(), 0);
}

#[tokio::test]
async fn cluster_scoped_objects_cannot_be_owned_by_a_namespaced_instance() {
    let rendered = "\
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: w-role
  namespace: default
rules: []
";
    let cluster_role = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
    let h = seeded(rendered).await;
    h.store.register_cluster_scoped(&cluster_role);

    let err = h
        .reconciler
        .reconcile(Some("default"), "w")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(h.store.list(&cluster_role).is_empty());
    assert_eq!(h.tool.deploy_count(), 0);
}

#[tokio::test]
async fn cluster_scoped_instances_may_own_cluster_scoped_objects() {
    let rendered = "\
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: w-role
rules: []
";
    let cluster_role = GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole");
    let h = harness(rendered);
    h.store.register_cluster_scoped(&widget_gvk());
    h.store.register_cluster_scoped(&cluster_role);
    let mut instance = widget("w", "default");
    instance.metadata.namespace = None;
    h.store.create(&instance).await.unwrap();

    h.reconciler.reconcile(None, "w").await.unwrap();

    let roles = h.store.list(&cluster_role);
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].namespace(), None);
    assert_eq!(roles[0].owner_references()[0].name, "w");
    assert_eq!(h.tool.deploy_count(), 1);
}

// ============================================================================
// Deletion Path
// ============================================================================

#[tokio::test]
async fn deletion_tears_down_then_releases() {
    let h = seeded(RENDERED).await;
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert!(h.store.delete(&instance_key()).await.unwrap());
    let marked = h.store.get(&instance_key()).await.unwrap().unwrap();
    assert!(marked.metadata.deletion_timestamp.is_some());

    let action = h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert_eq!(action, Action::await_change());
    let deletes = h.tool.deletes.lock().unwrap().clone();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].name, "w");
    assert_eq!(deletes[0].namespace.as_deref(), Some("default"));
    assert!(h.store.get(&instance_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_application_counts_as_torn_down() {
    let h = seeded(RENDERED).await;
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    h.tool.set_delete_outcome(DeleteOutcome::Missing);

    h.store.delete(&instance_key()).await.unwrap();
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert!(h.store.get(&instance_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_teardown_keeps_the_finalizer() {
    let h = seeded(RENDERED).await;
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    h.tool.set_delete_outcome(DeleteOutcome::Fails);

    h.store.delete(&instance_key()).await.unwrap();
    let err = h
        .reconciler
        .reconcile(Some("default"), "w")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ToolFailed { tool: "kapp", .. }));
    let stored = h.store.get(&instance_key()).await.unwrap().unwrap();
    assert_eq!(stored.finalizers(), [DEFAULT_FINALIZER.to_string()]);

    // Once kapp recovers the retry completes the deletion
    h.tool.set_delete_outcome(DeleteOutcome::Deleted);
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    assert!(h.store.get(&instance_key()).await.unwrap().is_none());
    assert_eq!(h.tool.delete_count(), 2);
}

#[tokio::test]
async fn deleting_instance_is_never_deployed() {
    let h = seeded(RENDERED).await;
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    h.store.delete(&instance_key()).await.unwrap();

    h.reconciler.reconcile(Some("default"), "w").await.unwrap();

    assert_eq!(h.tool.deploy_count(), 1);
    assert_eq!(h.engine.inputs().len(), 1);
}

// ============================================================================
// Garbage Collection
// ============================================================================

#[tokio::test]
async fn force_deleted_instance_leaves_no_orphans() {
    let h = seeded(RENDERED).await;
    h.reconciler.reconcile(Some("default"), "w").await.unwrap();
    assert_eq!(h.store.list(&config_map_gvk()).len(), 1);

    assert!(h.store.force_delete(&instance_key()));
    let collected = h.store.collect_garbage();

    assert_eq!(collected.len(), 2);
    assert!(h.store.list(&config_map_gvk()).is_empty());
    assert!(h.store.list(&service_gvk()).is_empty());
}
