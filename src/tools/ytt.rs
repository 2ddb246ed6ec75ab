//! ytt template engine invocation

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::TemplateEngine;
use crate::error::{Error, Result};
use crate::metrics;

/// Marks the instance document as ytt data values
pub const DATA_VALUES_HEADER: &str = "#@data/values\n---\n";

/// Runs `ytt -f <script>... -f -` with the instance on stdin
pub struct Ytt {
    program: PathBuf,
    scripts: Vec<PathBuf>,
    shutdown: CancellationToken,
}

impl Ytt {
    pub fn new(program: impl Into<PathBuf>, scripts: Vec<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scripts,
            shutdown: CancellationToken::new(),
        }
    }

    /// Kill a running render when `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Command line arguments for one render
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.scripts.len() * 2 + 2);
        for script in &self.scripts {
            args.push("-f".to_string());
            args.push(script.display().to_string());
        }
        args.push("-f".to_string());
        args.push("-".to_string());
        args
    }
}

/// Standard input for one render
pub fn data_values_input(instance_yaml: &str) -> String {
    format!("{}{}", DATA_VALUES_HEADER, instance_yaml)
}

#[async_trait]
impl TemplateEngine for Ytt {
    async fn render(&self, instance_yaml: &str) -> Result<Vec<u8>> {
        let _timer = metrics::TOOL_DURATION
            .with_label_values(&["ytt", "template"])
            .start_timer();

        debug!(program = %self.program.display(), scripts = self.scripts.len(), "Invoking ytt");

        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::config("Failed to capture ytt stdin"))?;
        let input = data_values_input(instance_yaml).into_bytes();
        let writer = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };

        let finished = async move { tokio::join!(writer, child.wait_with_output()) };
        let (written, output) = tokio::select! {
            finished = finished => finished,
            _ = self.shutdown.cancelled() => {
                metrics::TOOL_INVOCATIONS
                    .with_label_values(&["ytt", "template", "cancelled"])
                    .inc();
                warn!("Shutting down, ytt killed");
                return Err(Error::Cancelled {
                    tool: "ytt",
                    operation: "template",
                });
            }
        };
        let output = output?;

        if !output.status.success() {
            metrics::TOOL_INVOCATIONS
                .with_label_values(&["ytt", "template", "failure"])
                .inc();

            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            error!(status = %output.status, output = %combined, "ytt failed");

            return Err(Error::ToolFailed {
                tool: "ytt",
                operation: "template",
                message: output.status.to_string(),
                output: combined,
            });
        }
        // A write error only matters when ytt itself did not report failure.
        written?;

        metrics::TOOL_INVOCATIONS
            .with_label_values(&["ytt", "template", "success"])
            .inc();
        Ok(output.stdout)
    }
}
