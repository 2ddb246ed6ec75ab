//! Worker bootstrap
//!
//! A worker serves exactly one Reconciler: it reads the Reconciler, writes
//! its scripts to disk and runs one instance controller per target kind.

use std::sync::Arc;

use futures::future::try_join_all;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::crd::{validate_reconciler, Reconciler};
use crate::error::{Error, Result};
use crate::reconcilers::InstanceReconciler;
use crate::scripts::ScriptDir;
use crate::store::{KubeStore, ResourceStore};
use crate::tools::{ConvergenceTool, Kapp, TemplateEngine, Ytt};

/// Load the assigned Reconciler from the operator namespace
pub async fn load_reconciler(client: Client, namespace: &str, name: &str) -> Result<Reconciler> {
    let api: Api<Reconciler> = Api::namespaced(client, namespace);
    let reconciler = api
        .get_opt(name)
        .await
        .map_err(|e| {
            Error::bootstrap(format!("Unable to retrieve Reconciler '{}': {}", name, e))
        })?
        .ok_or_else(|| {
            Error::bootstrap(format!(
                "Reconciler '{}' not found in namespace '{}'",
                name, namespace
            ))
        })?;
    validate_reconciler(&reconciler)?;
    Ok(reconciler)
}

/// Run the worker for `reconciler_name` until `shutdown`
pub async fn run(
    client: Client,
    settings: Arc<Settings>,
    reconciler_name: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let reconciler = load_reconciler(client.clone(), &settings.namespace, reconciler_name).await?;
    let scripts = ScriptDir::materialize(&reconciler)?;

    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let engine: Arc<dyn TemplateEngine> = Arc::new(
        Ytt::new(&settings.ytt_path, scripts.files().to_vec()).with_shutdown(shutdown.clone()),
    );
    let tool: Arc<dyn ConvergenceTool> =
        Arc::new(Kapp::new(&settings.kapp_path).with_shutdown(shutdown.clone()));

    let kinds = reconciler.target_gvks();
    if kinds.is_empty() {
        info!(
            reconciler = reconciler_name,
            "Reconciler lists no kinds, idling until shutdown"
        );
    }
    info!(
        reconciler = reconciler_name,
        kinds = kinds.len(),
        scripts = scripts.files().len(),
        "Starting worker"
    );

    let loops = kinds.into_iter().map(|gvk| {
        let reconciler = Arc::new(InstanceReconciler::new(
            store.clone(),
            engine.clone(),
            tool.clone(),
            gvk,
        ));
        super::run_instance_controller(
            client.clone(),
            reconciler,
            settings.concurrency,
            shutdown.clone(),
        )
    });
    let result = try_join_all(loops).await;

    // Scripts stay on disk until every loop has stopped
    drop(scripts);

    if let Err(e) = result {
        error!(reconciler = reconciler_name, error = %e, "Instance controller failed");
        return Err(e);
    }

    shutdown.cancelled().await;
    info!(reconciler = reconciler_name, "Worker stopped");
    Ok(())
}
