//! Command line and environment configuration

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Command line arguments, with environment fallbacks
#[derive(Parser, Debug, Clone)]
#[command(name = "ytt-operator")]
#[command(about = "Reconciles Kubernetes resources through ytt and kapp", long_about = None)]
#[command(version)]
pub struct Args {
    /// Reconciler this process works for. Without it the process runs as
    /// the provisioner that starts one worker per Reconciler.
    #[arg(long, env = "RECONCILER_NAME")]
    pub reconciler_name: Option<String>,

    /// Name of the pod this process runs in
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace of the pod this process runs in
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: String,

    /// Container of the operator pod that runs this binary
    #[arg(long, default_value = "manager")]
    pub manager_container: String,

    /// Port for metrics and health endpoints
    #[arg(long, default_value_t = 8080)]
    pub metrics_port: u16,

    /// Maximum number of concurrent reconciles per controller
    #[arg(long, default_value_t = 4)]
    pub concurrency: u16,

    /// ytt executable
    #[arg(long, env = "YTT_PATH", default_value = "ytt")]
    pub ytt_path: PathBuf,

    /// kapp executable
    #[arg(long, env = "KAPP_PATH", default_value = "kapp")]
    pub kapp_path: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// What this process does
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Provision one worker per Reconciler, using this pod as template
    Provisioner { pod_name: String },
    /// Reconcile the kinds listed by one Reconciler
    Worker { reconciler_name: String },
}

/// Resolved, immutable process settings
#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: Mode,
    pub namespace: String,
    pub manager_container: String,
    pub metrics_port: u16,
    pub concurrency: u16,
    pub ytt_path: PathBuf,
    pub kapp_path: PathBuf,
    pub log_format: LogFormat,
}

impl Args {
    /// Resolve into settings, rejecting inconsistent combinations
    pub fn into_settings(self) -> Result<Settings> {
        if self.pod_namespace.trim().is_empty() {
            return Err(Error::config("Pod namespace must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(Error::config("Concurrency must be at least 1"));
        }

        let mode = match (non_empty(self.reconciler_name), non_empty(self.pod_name)) {
            (Some(reconciler_name), _) => Mode::Worker { reconciler_name },
            (None, Some(pod_name)) => Mode::Provisioner { pod_name },
            (None, None) => {
                return Err(Error::config(
                    "Either --reconciler-name or --pod-name must be set",
                ))
            }
        };

        Ok(Settings {
            mode,
            namespace: self.pod_namespace,
            manager_container: self.manager_container,
            metrics_port: self.metrics_port,
            concurrency: self.concurrency,
            ytt_path: self.ytt_path,
            kapp_path: self.kapp_path,
            log_format: self.log_format,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
