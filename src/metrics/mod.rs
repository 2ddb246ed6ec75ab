//! Prometheus metrics for the ytt operator
//!
//! Counters and histograms for reconciliations and tool invocations, plus
//! the HTTP endpoint that serves them together with health probes.

mod prometheus;

pub use prometheus::*;
