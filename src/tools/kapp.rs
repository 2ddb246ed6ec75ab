//! kapp convergence tool invocation

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::log_bridge::{pump, Channel, LogBridge, TracingSink};
use super::{Application, ConvergenceTool};
use crate::error::{Error, Result};
use crate::metrics;

/// Runs `kapp deploy` / `kapp delete` for one application
///
/// A running invocation is killed as soon as the shutdown token fires.
pub struct Kapp {
    program: PathBuf,
    shutdown: CancellationToken,
}

impl Kapp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Kill running invocations when `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Arguments for `kapp deploy`, manifests read from stdin
    pub fn deploy_args(app: &Application) -> Vec<String> {
        let mut args = Self::app_args("deploy", app);
        args.extend(["-f".to_string(), "-".to_string()]);
        args
    }

    /// Arguments for `kapp delete`
    pub fn delete_args(app: &Application) -> Vec<String> {
        Self::app_args("delete", app)
    }

    fn app_args(command: &str, app: &Application) -> Vec<String> {
        let mut args = vec![
            command.to_string(),
            "-y".to_string(),
            "-a".to_string(),
            app.name.clone(),
        ];
        if let Some(ns) = &app.namespace {
            args.extend(["-n".to_string(), ns.clone()]);
        }
        args
    }

    async fn run(
        &self,
        operation: &'static str,
        app: &Application,
        args: Vec<String>,
        input: Option<&[u8]>,
    ) -> Result<()> {
        let _timer = metrics::TOOL_DURATION
            .with_label_values(&["kapp", operation])
            .start_timer();

        debug!(app = %app, ?args, "Invoking kapp");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::config("Failed to capture kapp stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::config("Failed to capture kapp stderr"))?;

        let writer = async move {
            match (stdin, input) {
                (Some(mut stdin), Some(input)) => {
                    stdin.write_all(input).await?;
                    stdin.shutdown().await
                }
                _ => Ok(()),
            }
        };
        let out_bridge = LogBridge::new(Channel::Stdout, TracingSink::new("kapp", app.to_string()));
        let err_bridge = LogBridge::new(Channel::Stderr, TracingSink::new("kapp", app.to_string()));

        // The child lives inside this future: dropping it kills kapp.
        let finished = async move {
            let (written, out, err) = tokio::join!(
                writer,
                pump(stdout, out_bridge),
                pump(stderr, err_bridge)
            );
            let status = child.wait().await?;
            Ok::<_, Error>((written, out?.0, err?.0, status))
        };

        let (written, out, err, status) = tokio::select! {
            finished = finished => finished?,
            _ = self.shutdown.cancelled() => {
                metrics::TOOL_INVOCATIONS
                    .with_label_values(&["kapp", operation, "cancelled"])
                    .inc();
                warn!(app = %app, operation, "Shutting down, kapp killed");
                return Err(Error::Cancelled {
                    tool: "kapp",
                    operation,
                });
            }
        };

        if status.success() {
            written?;
            metrics::TOOL_INVOCATIONS
                .with_label_values(&["kapp", operation, "success"])
                .inc();
            info!(app = %app, operation, "kapp finished");
            return Ok(());
        }

        let stderr_text = String::from_utf8_lossy(&err).into_owned();
        if operation == "delete" && reports_missing_app(&stderr_text) {
            metrics::TOOL_INVOCATIONS
                .with_label_values(&["kapp", operation, "not_found"])
                .inc();
            return Err(Error::ApplicationNotFound(app.to_string()));
        }

        metrics::TOOL_INVOCATIONS
            .with_label_values(&["kapp", operation, "failure"])
            .inc();
        error!(app = %app, operation, %status, "kapp failed");

        let mut combined = String::from_utf8_lossy(&out).into_owned();
        combined.push_str(&stderr_text);
        Err(Error::ToolFailed {
            tool: "kapp",
            operation,
            message: status.to_string(),
            output: combined,
        })
    }
}

/// Whether kapp's error output says the application is unknown
pub fn reports_missing_app(stderr: &str) -> bool {
    stderr
        .lines()
        .any(|l| l.contains("App '") && l.contains("does not exist"))
}

#[async_trait]
impl ConvergenceTool for Kapp {
    async fn deploy(&self, app: &Application, manifests: &[u8]) -> Result<()> {
        self.run("deploy", app, Self::deploy_args(app), Some(manifests))
            .await
    }

    async fn delete(&self, app: &Application) -> Result<()> {
        self.run("delete", app, Self::delete_args(app), None).await
    }
}
