//! Instance controller
//!
//! Watches every object of one runtime-chosen kind and triggers
//! reconciliation through an [`InstanceReconciler`].

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::DynamicObject,
    discovery,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::InstanceReconciler;

/// Run the controller for the kind handled by `reconciler` until `shutdown`
pub async fn run(
    client: Client,
    reconciler: Arc<InstanceReconciler>,
    concurrency: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let gvk = reconciler.gvk().clone();

    let (resource, _caps) = discovery::pinned_kind(&client, &gvk).await.map_err(|e| {
        Error::bootstrap(format!(
            "Kind {}/{} {} is not served: {}",
            gvk.group, gvk.version, gvk.kind, e
        ))
    })?;
    let api: Api<DynamicObject> = Api::all_with(client, &resource);

    info!(
        kind = %gvk.kind,
        group = %gvk.group,
        version = %gvk.version,
        "Starting instance controller"
    );
    metrics::WATCHED_KINDS
        .with_label_values(&[gvk.kind.as_str()])
        .set(1.0);

    Controller::new_with(api, WatcherConfig::default(), resource)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Reconciled instance"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;

    metrics::WATCHED_KINDS
        .with_label_values(&[gvk.kind.as_str()])
        .set(0.0);
    info!(kind = %gvk.kind, "Instance controller stopped");
    Ok(())
}

/// Main reconciliation function
#[instrument(skip(obj, ctx), fields(kind = %ctx.gvk().kind, name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<InstanceReconciler>) -> Result<Action> {
    let kind = ctx.gvk().kind.clone();
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[kind.as_str()])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&[kind.as_str()])
        .inc();

    ctx.reconcile(obj.namespace().as_deref(), &obj.name_any())
        .await
}

/// Error policy for the controller
fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<InstanceReconciler>) -> Action {
    let kind = ctx.gvk().kind.as_str();
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[kind, error.reason()])
        .inc();

    let requeue = error.requeue_after();
    match error {
        Error::ToolFailed { output, .. } => error!(
            kind = %kind,
            name = %obj.name_any(),
            namespace = obj.namespace(),
            error = %error,
            output = %output,
            "Reconciliation failed, scheduling retry in {:?}",
            requeue
        ),
        _ => error!(
            kind = %kind,
            name = %obj.name_any(),
            namespace = obj.namespace(),
            error = %error,
            "Reconciliation failed, scheduling retry in {:?}",
            requeue
        ),
    }

    Action::requeue(requeue)
}
