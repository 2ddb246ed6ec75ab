//! ytt Kubernetes Operator
//!
//! Reconciles resources of arbitrary kinds by rendering them through ytt
//! scripts and deploying the result with kapp. A provisioner starts one
//! worker per `Reconciler` resource; each worker watches the kinds its
//! Reconciler lists.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod manifests;
pub mod metrics;
pub mod reconcilers;
pub mod scripts;
pub mod store;
pub mod tools;

pub use error::{Error, Result};
