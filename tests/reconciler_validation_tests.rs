//! Integration tests for Reconciler validation
//!
//! These tests verify that `validate_reconciler` accepts well-formed
//! Reconcilers and rejects the ones a worker could not run.

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use ytt_operator::crd::{
    validate_reconciler, Reconciler, ReconcilerScript, ReconcilerSpec, TargetKind,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn script(name: &str, body: &str) -> ReconcilerScript {
    ReconcilerScript {
        name: name.to_string(),
        encoded: STANDARD.encode(body),
    }
}

fn valid_spec() -> ReconcilerSpec {
    ReconcilerSpec {
        targets: vec![
            TargetKind::new("example.com/v1", "Widget"),
            TargetKind::new("v1", "ConfigMap"),
        ],
        scripts: vec![
            script("widget.yaml", "#@ load(\"@ytt:data\", \"data\")\n"),
            script("helpers.star", "def name(): return 'x'\n"),
        ],
        service_account_name: None,
    }
}

fn create_reconciler(spec: ReconcilerSpec) -> Reconciler {
    Reconciler {
        metadata: ObjectMeta {
            name: Some("test-reconciler".to_string()),
            namespace: Some("ytt-system".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn error_message(spec: ReconcilerSpec) -> String {
    validate_reconciler(&create_reconciler(spec))
        .expect_err("validation should fail")
        .to_string()
}

// ============================================================================
// Valid Specs
// ============================================================================

#[test]
fn valid_spec_passes_validation() {
    let result = validate_reconciler(&create_reconciler(valid_spec()));
    if let Err(e) = &result {
        panic!("Validation failed unexpectedly: {:?}", e);
    }
}

#[test]
fn reconciler_without_scripts_passes_validation() {
    let mut spec = valid_spec();
    spec.scripts.clear();
    assert!(validate_reconciler(&create_reconciler(spec)).is_ok());
}

#[test]
fn padded_base64_is_accepted() {
    let mut spec = valid_spec();
    spec.scripts[0].encoded = format!("{}\n", spec.scripts[0].encoded);
    assert!(validate_reconciler(&create_reconciler(spec)).is_ok());
}

// ============================================================================
// Targets
// ============================================================================

#[test]
fn empty_kind_fails_validation() {
    let mut spec = valid_spec();
    spec.targets.push(TargetKind::new("example.com/v1", ""));
    assert!(error_message(spec).contains("kinds must not be empty"));
}

#[test]
fn missing_api_version_fails_validation() {
    let mut spec = valid_spec();
    spec.targets.push(TargetKind::new(" ", "Gadget"));
    assert!(error_message(spec).contains("Gadget"));
}

// ============================================================================
// Scripts
// ============================================================================

#[test]
fn duplicate_script_names_fail_validation() {
    let mut spec = valid_spec();
    spec.scripts.push(script("widget.yaml", "a: 1\n"));
    assert!(error_message(spec).contains("Duplicate script name 'widget.yaml'"));
}

#[test]
fn empty_script_name_fails_validation() {
    let mut spec = valid_spec();
    spec.scripts.push(script("", "a: 1\n"));
    assert!(error_message(spec).contains("must not be empty"));
}

#[test]
fn script_names_with_paths_fail_validation() {
    for name in ["../escape.yaml", "nested/file.yaml", "..", "."] {
        let mut spec = valid_spec();
        spec.scripts.push(script(name, "a: 1\n"));
        assert!(
            error_message(spec).contains("plain file name"),
            "name {:?} was accepted",
            name
        );
    }
}

#[test]
fn undecodable_script_fails_validation() {
    let mut spec = valid_spec();
    spec.scripts.push(ReconcilerScript {
        name: "broken.yaml".to_string(),
        encoded: "%%% not base64 %%%".to_string(),
    });
    assert!(error_message(spec).contains("not valid base64"));
}
