//! Reconciler Custom Resource Definition

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::core::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reconciler resource specification
///
/// Each Reconciler gets its own worker process that watches the listed kinds
/// and renders every instance through the listed scripts.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ytt-operator.io",
    version = "v1alpha1",
    kind = "Reconciler",
    plural = "reconcilers",
    singular = "reconciler",
    shortname = "ytr",
    namespaced,
    status = "ReconcilerStatus",
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerSpec {
    /// Resource kinds to reconcile
    #[serde(rename = "for", default)]
    pub targets: Vec<TargetKind>,

    /// Scripts fed to ytt for every instance
    #[serde(default)]
    pub scripts: Vec<ReconcilerScript>,

    /// Service account the worker runs as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// A watched resource kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TargetKind {
    /// API version, either `group/version` or a bare core version
    pub api_version: String,
    /// Kind name
    pub kind: String,
}

impl TargetKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Group/version/kind of this target
    pub fn gvk(&self) -> GroupVersionKind {
        gvk_from_api_version(&self.api_version, &self.kind)
    }
}

/// Split an apiVersion string into its group and version
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// A named script payload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerScript {
    /// File name the script is written to
    pub name: String,

    /// Base64 encoded script body. Encoding keeps ytt markers inside the
    /// script from being evaluated when the Reconciler itself is templated.
    pub encoded: String,
}

impl ReconcilerScript {
    /// Decode the script body
    pub fn decode(&self) -> Result<Vec<u8>> {
        STANDARD.decode(self.encoded.trim()).map_err(|e| {
            Error::validation(format!("Script '{}' is not valid base64: {}", self.name, e))
        })
    }
}

/// Reconciler status. Nothing is reported back yet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ReconcilerStatus {}

impl Reconciler {
    /// Group/version/kind of the Reconciler resource itself
    pub fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(
            &<Reconciler as kube::Resource>::group(&()),
            &<Reconciler as kube::Resource>::version(&()),
            &<Reconciler as kube::Resource>::kind(&()),
        )
    }

    /// Distinct target kinds, in declaration order
    pub fn target_gvks(&self) -> Vec<GroupVersionKind> {
        let mut kinds: Vec<GroupVersionKind> = Vec::with_capacity(self.spec.targets.len());
        for gvk in self.spec.targets.iter().map(TargetKind::gvk) {
            if !kinds.contains(&gvk) {
                kinds.push(gvk);
            }
        }
        kinds
    }
}

/// Validate a Reconciler spec
pub fn validate_reconciler(reconciler: &Reconciler) -> Result<()> {
    for target in &reconciler.spec.targets {
        if target.kind.trim().is_empty() {
            return Err(Error::validation("Target kinds must not be empty"));
        }
        if target.api_version.trim().is_empty() {
            return Err(Error::validation(format!(
                "Target kind '{}' has no apiVersion",
                target.kind
            )));
        }
    }

    let mut seen = HashSet::new();
    for script in &reconciler.spec.scripts {
        validate_script_name(&script.name)?;
        if !seen.insert(script.name.as_str()) {
            return Err(Error::validation(format!(
                "Duplicate script name '{}'",
                script.name
            )));
        }
        script.decode()?;
    }

    Ok(())
}

fn validate_script_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("Script names must not be empty"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(Error::validation(format!(
            "Script name '{}' must be a plain file name",
            name
        )));
    }
    Ok(())
}
