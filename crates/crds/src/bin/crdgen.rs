//! Emits all VMops CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run --bin crdgen > config/crds.yaml`

use kube::CustomResourceExt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let crds = [
        crds::VirtualMachine::crd(),
        crds::AddressClaim::crd(),
        crds::VmCluster::crd(),
        crds::DeploymentZone::crd(),
        crds::FailureDomain::crd(),
    ];

    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
