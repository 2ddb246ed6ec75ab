//! ytt Kubernetes Operator
//!
//! Main entry point. Without `--reconciler-name` the process provisions one
//! worker per Reconciler; with it, the process is such a worker.

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ytt_operator::{
    config::{Args, LogFormat, Mode, Settings},
    controllers,
    metrics,
    reconcilers::{ParentTemplate, WorkerProvisioner},
    store::KubeStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Args::parse().into_settings()?);

    // Initialize tracing
    init_tracing(settings.log_format);

    info!(mode = ?settings.mode, namespace = %settings.namespace, "Starting ytt operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(settings.metrics_port, shutdown.clone()));
    info!("Metrics server starting on port {}", settings.metrics_port);

    let operator = run_mode(client, settings.clone(), shutdown.clone());
    tokio::pin!(operator);

    // Handle graceful shutdown
    let outcome = tokio::select! {
        result = &mut operator => result,
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
            shutdown.cancel();
            operator.await
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
            shutdown.cancel();
            operator.await
        }
    };
    shutdown.cancel();

    if let Err(e) = outcome {
        error!(error = %e, "ytt operator failed");
        return Err(e.into());
    }

    info!("ytt operator stopped");
    Ok(())
}

/// Run the provisioner or the worker, depending on the settings
async fn run_mode(
    client: Client,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
) -> ytt_operator::Result<()> {
    match &settings.mode {
        Mode::Worker { reconciler_name } => {
            controllers::run_worker(client, settings.clone(), reconciler_name, shutdown).await
        }
        Mode::Provisioner { pod_name } => {
            // The running pod is the template for every worker
            let pods: Api<Pod> = Api::namespaced(client.clone(), &settings.namespace);
            let pod = pods.get(pod_name).await.map_err(|e| {
                ytt_operator::Error::bootstrap(format!(
                    "Unable to retrieve parent pod '{}': {}",
                    pod_name, e
                ))
            })?;
            let parent = ParentTemplate::from_pod(pod, settings.manager_container.clone())?;

            let store = Arc::new(KubeStore::new(client.clone()));
            let provisioner = Arc::new(WorkerProvisioner::new(store, parent));
            controllers::run_reconciler_controller(
                client,
                provisioner,
                settings.concurrency,
                shutdown,
            )
            .await
        }
    }
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
