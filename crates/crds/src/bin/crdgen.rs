//! Prints the PodTracker CustomResourceDefinition as YAML.
//!
//! Usage: `cargo run --bin crdgen | kubectl apply -f -`

use crds::PodTracker;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&PodTracker::crd())?);
    Ok(())
}
