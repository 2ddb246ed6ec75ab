//! External tools the reconcilers drive
//!
//! Rendering goes through a [`TemplateEngine`] (ytt) and convergence through
//! a [`ConvergenceTool`] (kapp). Both are injected into the reconcilers so
//! tests can substitute fakes for the real subprocesses.

pub mod kapp;
pub mod log_bridge;
pub mod ytt;

pub use kapp::Kapp;
pub use ytt::Ytt;

use std::fmt;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::error::Result;

/// A named set of manifests managed as one unit by the convergence tool
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Application {
    pub name: String,
    pub namespace: Option<String>,
}

impl Application {
    /// The application owned by an instance: its name, scoped to its namespace
    pub fn for_instance<K: ResourceExt>(instance: &K) -> Self {
        Self {
            name: instance.name_any(),
            namespace: instance.namespace(),
        }
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Turns one instance document plus the worker's scripts into manifests
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Render an instance, given as YAML, into a multi-document stream
    async fn render(&self, instance_yaml: &str) -> Result<Vec<u8>>;
}

/// Diffs and applies, or tears down, a named application
#[async_trait]
pub trait ConvergenceTool: Send + Sync {
    /// Converge the application to exactly the given manifests
    async fn deploy(&self, app: &Application, manifests: &[u8]) -> Result<()>;

    /// Remove everything belonging to the application.
    /// Fails with [`crate::Error::ApplicationNotFound`] for unknown applications.
    async fn delete(&self, app: &Application) -> Result<()>;
}
