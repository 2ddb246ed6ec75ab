//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the Reconciler
//! resource defined by the ytt-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/reconcilers.yaml

use ytt_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
