//! Custom Resource Definitions for the ytt operator

mod reconciler;

pub use reconciler::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![serde_yaml::to_string(&Reconciler::crd())?])
}
