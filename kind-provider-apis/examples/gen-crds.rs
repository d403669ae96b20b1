use kind_provider_apis::{
    Cluster, NamespacedCluster, NamespacedProviderConfigUsage, ProviderConfig, ProviderConfigUsage,
};
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Cluster::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&ProviderConfig::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&ProviderConfigUsage::crd()).unwrap());
    println!("---");
    println!("{}", serde_yaml::to_string(&NamespacedCluster::crd()).unwrap());
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&NamespacedProviderConfigUsage::crd()).unwrap()
    );
}
