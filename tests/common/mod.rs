//! Shared fakes and fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{DynamicObject, ObjectMeta};
use kube::core::{GroupVersionKind, TypeMeta};
use ytt_operator::tools::{Application, ConvergenceTool, TemplateEngine};
use ytt_operator::{Error, Result};

pub fn widget_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("example.com", "v1", "Widget")
}

pub fn widget(name: &str, namespace: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "example.com/v1".to_string(),
            kind: "Widget".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": { "size": 3 } }),
    }
}

/// Template engine returning a fixed stream and recording its inputs
pub struct FakeEngine {
    output: Vec<u8>,
    inputs: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new(output: &str) -> Self {
        Self {
            output: output.as_bytes().to_vec(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TemplateEngine for FakeEngine {
    async fn render(&self, instance_yaml: &str) -> Result<Vec<u8>> {
        self.inputs.lock().unwrap().push(instance_yaml.to_string());
        Ok(self.output.clone())
    }
}

/// How [`FakeTool::delete`] answers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
    Fails,
}

/// Convergence tool recording every call
pub struct FakeTool {
    delete_outcome: Mutex<DeleteOutcome>,
    pub deploys: Mutex<Vec<(Application, Vec<u8>)>>,
    pub deletes: Mutex<Vec<Application>>,
}

impl FakeTool {
    pub fn new() -> Self {
        Self {
            delete_outcome: Mutex::new(DeleteOutcome::Deleted),
            deploys: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delete_outcome(&self, outcome: DeleteOutcome) {
        *self.delete_outcome.lock().unwrap() = outcome;
    }

    pub fn deploy_count(&self) -> usize {
        self.deploys.lock().unwrap().len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.lock().unwrap().len()
    }
}

#[async_trait]
impl ConvergenceTool for FakeTool {
    async fn deploy(&self, app: &Application, manifests: &[u8]) -> Result<()> {
        self.deploys
            .lock()
            .unwrap()
            .push((app.clone(), manifests.to_vec()));
        Ok(())
    }

    async fn delete(&self, app: &Application) -> Result<()> {
        self.deletes.lock().unwrap().push(app.clone());
        match *self.delete_outcome.lock().unwrap() {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::Missing => Err(Error::ApplicationNotFound(app.to_string())),
            DeleteOutcome::Fails => Err(Error::ToolFailed {
                tool: "kapp",
                operation: "delete",
                message: "exit status: 1".to_string(),
                output: "kapp: Error: connection refused".to_string(),
            }),
        }
    }
}
