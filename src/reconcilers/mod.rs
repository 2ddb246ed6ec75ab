//! Reconcilers for the ytt operator
//!
//! This module contains the business logic behind each control loop:
//! - `instance`: renders and deploys instances of a watched kind
//! - `worker`: provisions one worker Deployment per Reconciler

pub mod instance;
pub mod worker;

pub use instance::InstanceReconciler;
pub use worker::{worker_name, ParentTemplate, WorkerProvisioner};
