//! Projection of [`ClusterParameters`] into the KIND `kind.x-k8s.io/v1alpha4` cluster
//! configuration, see <https://kind.sigs.k8s.io/docs/user/configuration/>.
//!
//! Unset optional parameters are left out of the generated document, so that KIND
//! applies its own defaults for them.

use std::collections::BTreeMap;

use kind_provider_apis::{
    ClusterParameters, IpFamily, Mount, MountPropagation, Networking, Node, NodeRole, PortMapping,
    PortMappingProtocol, ProxyMode,
};
use serde::{Deserialize, Serialize};

pub(crate) const KIND_API_VERSION: &'static str = "kind.x-k8s.io/v1alpha4";
pub(crate) const KIND_CLUSTER: &'static str = "Cluster";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KindCluster {
    pub kind: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<KindNode>,
    #[serde(default, skip_serializing_if = "KindNetworking::is_empty")]
    pub networking: KindNetworking,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containerd_config_patches: Vec<String>,
}

impl KindCluster {
    pub(crate) fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KindNode {
    pub role: NodeRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<KindMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_port_mappings: Vec<KindPortMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubeadm_config_patches: Vec<String>,
}

impl KindNode {
    fn control_plane() -> Self {
        Self {
            role: NodeRole::ControlPlane,
            image: None,
            labels: Default::default(),
            extra_mounts: Default::default(),
            extra_port_mappings: Default::default(),
            kubeadm_config_patches: Default::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KindMount {
    pub container_path: String,
    pub host_path: String,
    #[serde(rename = "readOnly", skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_relabel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<MountPropagation>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KindPortMapping {
    pub container_port: i32,
    pub host_port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PortMappingProtocol>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KindNetworking {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<IpFamily>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_subnet: Option<String>,
    #[serde(rename = "disableDefaultCNI", skip_serializing_if = "Option::is_none")]
    pub disable_default_cni: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_proxy_mode: Option<ProxyMode>,
}

impl KindNetworking {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl From<&Mount> for KindMount {
    fn from(m: &Mount) -> Self {
        Self {
            container_path: m.container_path.clone(),
            host_path: m.host_path.clone(),
            read_only: m.readonly,
            selinux_relabel: m.selinux_relabel,
            propagation: m.propagation,
        }
    }
}

impl From<&PortMapping> for KindPortMapping {
    fn from(pm: &PortMapping) -> Self {
        Self {
            container_port: pm.container_port,
            host_port: pm.host_port,
            listen_address: pm.listen_address.clone(),
            protocol: pm.protocol,
        }
    }
}

impl From<&Node> for KindNode {
    fn from(node: &Node) -> Self {
        Self {
            role: node.role(),
            image: node.image.clone(),
            labels: node.labels.clone(),
            extra_mounts: node.extra_mounts.iter().map(KindMount::from).collect(),
            extra_port_mappings: node
                .extra_port_mappings
                .iter()
                .map(KindPortMapping::from)
                .collect(),
            kubeadm_config_patches: node.kubeadm_config_patches.clone(),
        }
    }
}

impl From<&Networking> for KindNetworking {
    fn from(net: &Networking) -> Self {
        Self {
            ip_family: net.ip_family,
            api_server_port: net.api_server_port,
            api_server_address: net.api_server_address.clone(),
            pod_subnet: net.pod_subnet.clone(),
            service_subnet: net.service_subnet.clone(),
            disable_default_cni: net.disable_default_cni,
            kube_proxy_mode: net.kube_proxy_mode,
        }
    }
}

/// Build the KIND cluster configuration for `params`.
///
/// An empty node list yields a single control-plane node. The kube-proxy mode of
/// `params.networking` wins over the top-level one.
pub(crate) fn project(params: &ClusterParameters) -> KindCluster {
    let mut nodes: Vec<KindNode> = params.nodes.iter().map(KindNode::from).collect();
    if nodes.is_empty() {
        nodes.push(KindNode::control_plane());
    }
    let mut networking = params
        .networking
        .as_ref()
        .map(KindNetworking::from)
        .unwrap_or_default();
    if networking.kube_proxy_mode.is_none() {
        networking.kube_proxy_mode = params.kube_proxy_mode;
    }
    KindCluster {
        kind: KIND_CLUSTER.to_string(),
        api_version: KIND_API_VERSION.to_string(),
        nodes,
        networking,
        feature_gates: params.feature_gates.clone(),
        runtime_config: params.runtime_config.clone(),
        containerd_config_patches: params.containerd_config_patches.clone(),
    }
}
