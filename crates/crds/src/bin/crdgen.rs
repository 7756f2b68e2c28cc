//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{AllocatedNode, ClusterTemplate, ProvisioningRequest};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        ClusterTemplate::crd(),
        ProvisioningRequest::crd(),
        AllocatedNode::crd(),
    ];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
