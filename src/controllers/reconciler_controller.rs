//! Reconciler controller
//!
//! Watches Reconciler resources in the operator namespace, together with
//! the worker Deployments they own, and converges one worker per Reconciler.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::crd::Reconciler;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::WorkerProvisioner;

/// Run the Reconciler controller until `shutdown`
pub async fn run(
    client: Client,
    provisioner: Arc<WorkerProvisioner>,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let namespace = provisioner.parent().namespace().to_string();
    let api: Api<Reconciler> = Api::namespaced(client.clone(), &namespace);
    let deployments: Api<Deployment> = Api::namespaced(client, &namespace);

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Reconciler CRD not installed: {}", e);
        return Err(Error::bootstrap(format!("Reconciler CRD not installed: {}", e)));
    }

    info!(namespace = %namespace, "Starting Reconciler controller");
    metrics::WATCHED_KINDS
        .with_label_values(&["Reconciler"])
        .set(1.0);

    Controller::new(api, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, provisioner)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Reconciled Reconciler"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;

    metrics::WATCHED_KINDS
        .with_label_values(&["Reconciler"])
        .set(0.0);
    info!("Reconciler controller stopped");
    Ok(())
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Reconciler>, ctx: Arc<WorkerProvisioner>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["Reconciler"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["Reconciler"])
        .inc();

    let namespace = obj
        .namespace()
        .unwrap_or_else(|| ctx.parent().namespace().to_string());
    ctx.reconcile(&namespace, &obj.name_any()).await
}

/// Error policy for the controller
fn error_policy(obj: Arc<Reconciler>, error: &Error, _ctx: Arc<WorkerProvisioner>) -> Action {
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&["Reconciler", error.reason()])
        .inc();

    let requeue = error.requeue_after();
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry in {:?}",
        requeue
    );
    Action::requeue(requeue)
}
