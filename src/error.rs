//! Error types for the ytt operator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object vanished while it was being written
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Concurrent write detected through a stale resource version
    #[error("Conflicting write to {0}, will retry with a fresh copy")]
    Conflict(String),

    /// External tool exited non-zero
    #[error("{tool} {operation} failed: {message}")]
    ToolFailed {
        tool: &'static str,
        operation: &'static str,
        message: String,
        /// Captured tool output, kept for diagnostics
        output: String,
    },

    /// External tool was killed because the operator is shutting down
    #[error("{tool} {operation} cancelled by shutdown")]
    Cancelled {
        tool: &'static str,
        operation: &'static str,
    },

    /// Convergence tool does not know the application
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    /// Template output that cannot be turned into objects
    #[error("Malformed template output: {0}")]
    MalformedOutput(String),

    /// Derived object is already controlled by someone else
    #[error("Object {object} is already owned by {owner}")]
    AlreadyOwned { object: String, owner: String },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Worker could not be started
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a bootstrap error
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Error::Bootstrap(msg.into())
    }

    /// Create a malformed output error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedOutput(msg.into())
    }

    /// Map a kube error, keeping conflicts and missing objects distinguishable
    pub fn from_kube(err: kube::Error, object: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(object.to_string()),
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(object.to_string()),
            other => Error::Kube(other),
        }
    }

    /// Whether a retry with a re-fetched object is expected to succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Short error class, used as a metrics label
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::ToolFailed { .. } => "tool_failed",
            Error::Cancelled { .. } => "cancelled",
            Error::ApplicationNotFound(_) => "application_not_found",
            Error::MalformedOutput(_) => "malformed_output",
            Error::AlreadyOwned { .. } => "already_owned",
            Error::Validation(_) => "validation",
            Error::Bootstrap(_) => "bootstrap",
            Error::Config(_) => "config",
            Error::Serialization(_) | Error::Yaml(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    /// How long to wait before retrying after this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::Conflict(_) | Error::NotFound(_) => Duration::from_secs(5),
            Error::Kube(_) => Duration::from_secs(30),
            Error::ToolFailed { .. } | Error::MalformedOutput(_) => Duration::from_secs(60),
            Error::Validation(_) | Error::Config(_) | Error::AlreadyOwned { .. } => {
                Duration::from_secs(300)
            }
            _ => Duration::from_secs(30),
        }
    }
}
