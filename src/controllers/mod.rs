//! Kubernetes controllers for the ytt operator
//!
//! This module contains the controller implementations that watch for
//! changes and trigger reconciliation, plus the worker bootstrap.

mod instance_controller;
mod reconciler_controller;
pub mod worker;

pub use instance_controller::run as run_instance_controller;
pub use reconciler_controller::run as run_reconciler_controller;
pub use worker::run as run_worker;
