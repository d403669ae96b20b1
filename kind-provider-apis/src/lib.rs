use std::collections::BTreeMap;

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    chrono::{SecondsFormat, Utc},
};
use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "kind.crossplane.io";

/// Annotation holding the name of the KIND cluster backing a [`Cluster`].
pub const EXTERNAL_NAME_ANNOTATION: &'static str = "crossplane.io/external-name";

/// Label put on [`ProviderConfigUsage`] objects, its value is the name of the used [`ProviderConfig`].
pub const PROVIDER_CONFIG_LABEL: &'static str = "kind.crossplane.io/provider-config";

/// Name of the [`ProviderConfig`] used when a managed resource does not reference one.
pub const DEFAULT_PROVIDER_CONFIG: &'static str = "default";

/// Kind of the provider config served by this provider.
pub const PROVIDER_CONFIG_KIND: &'static str = "ProviderConfig";

pub const CONDITION_READY: &'static str = "Ready";
pub const CONDITION_SYNCED: &'static str = "Synced";

pub const REASON_AVAILABLE: &'static str = "Available";
pub const REASON_UNAVAILABLE: &'static str = "Unavailable";
pub const REASON_CREATING: &'static str = "Creating";
pub const REASON_DELETING: &'static str = "Deleting";
pub const REASON_RECONCILE_SUCCESS: &'static str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &'static str = "ReconcileError";
pub const REASON_IN_USE: &'static str = "InUse";

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another. This should be when the underlying condition changed.  If that is not known, then using the time when the API field changed is acceptable.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon. For instance, if .metadata.generation is currently 12, but the .status.conditions\[x\].observedGeneration is 9, the condition is out of date with respect to the current state of the instance.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition. Producers of specific condition types may define expected values and meanings for this field, and whether the values are considered a guaranteed API. The value should be a CamelCase string. This field may not be empty.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase or in foo.example.com/CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    /// The external cluster exists and all of its nodes are running.
    pub fn available() -> Self {
        Self::new(CONDITION_READY, Some(true), REASON_AVAILABLE, String::new())
    }

    pub fn unavailable() -> Self {
        Self::new(CONDITION_READY, Some(false), REASON_UNAVAILABLE, String::new())
    }

    pub fn creating() -> Self {
        Self::new(CONDITION_READY, Some(false), REASON_CREATING, String::new())
    }

    pub fn deleting() -> Self {
        Self::new(CONDITION_READY, Some(false), REASON_DELETING, String::new())
    }

    pub fn reconcile_success() -> Self {
        Self::new(
            CONDITION_SYNCED,
            Some(true),
            REASON_RECONCILE_SUCCESS,
            String::new(),
        )
    }

    pub fn reconcile_error(message: String) -> Self {
        Self::new(CONDITION_SYNCED, Some(false), REASON_RECONCILE_ERROR, message)
    }

    /// The ProviderConfig cannot be deleted while `users` managed resources use it.
    pub fn in_use(users: i64) -> Self {
        Self::new(
            CONDITION_READY,
            Some(false),
            REASON_IN_USE,
            format!("still used by {} managed resources", users),
        )
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Role of a KIND node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum NodeRole {
    #[serde(rename = "control-plane")]
    ControlPlane,
    #[serde(rename = "worker")]
    Worker,
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::ControlPlane
    }
}

/// Mount propagation mode of an extra mount.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum MountPropagation {
    None,
    HostToContainer,
    Bidirectional,
}

/// Network protocol of a port mapping.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum PortMappingProtocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SCTP")]
    Sctp,
}

/// IP address family of the cluster.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    Ipv4,
    #[serde(rename = "ipv6")]
    Ipv6,
    #[serde(rename = "dual")]
    Dual,
}

/// kube-proxy mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ProxyMode {
    #[serde(rename = "iptables")]
    Iptables,
    #[serde(rename = "ipvs")]
    Ipvs,
    #[serde(rename = "nftables")]
    Nftables,
    #[serde(rename = "none")]
    None,
}

/// What happens to the KIND cluster when its [`Cluster`] object is deleted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum DeletionPolicy {
    /// Delete the KIND cluster.
    Delete,
    /// Leave the KIND cluster running.
    Orphan,
}

impl Default for DeletionPolicy {
    fn default() -> Self {
        Self::Delete
    }
}

/// An action the provider may take on the KIND cluster of a managed resource.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ManagementAction {
    #[serde(rename = "*")]
    All,
    Observe,
    Create,
    Update,
    Delete,
    LateInitialize,
}

const FULL_CONTROL: &[ManagementAction] = &[ManagementAction::All];

/// Desired state of a KIND cluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParameters {
    /// The nodes of the cluster. If empty, a single control-plane node is created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    /// Cluster-wide networking configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,
    /// Kubernetes feature gates, passed to the cluster via kubeadm.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
    /// Passed to the API server as `--runtime-config=key=value` flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_config: BTreeMap<String, String>,
    /// The kube-proxy mode, `networking.kubeProxyMode` takes precedence if both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_proxy_mode: Option<ProxyMode>,
    /// TOML patches applied to the containerd config of all nodes. Only the last
    /// patch applying to a given node is used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containerd_config_patches: Vec<String>,
    /// How long to wait for the control plane to become ready after creation (e.g. "5m", "30s").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_ready: Option<String>,
}

/// A KIND cluster node.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// The node role, defaults to "control-plane".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
    /// The node image, defaults to the node image of the installed kind version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Additional mounts from the host into the node container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,
    /// Additional port mappings from the node container to the host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_port_mappings: Vec<PortMapping>,
    /// kubeadm config patches applied to this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubeadm_config_patches: Vec<String>,
    /// Additional labels for the Kubernetes node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn role(&self) -> NodeRole {
        self.role.unwrap_or_default()
    }
}

/// Bind mount from the host into a node container.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Absolute path on the host.
    pub host_path: String,
    /// Path inside the node container.
    pub container_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_relabel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<MountPropagation>,
}

/// Port forwarding from a node container to the host.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: i32,
    /// Port on the host, `0` lets the OS pick a free port.
    pub host_port: i32,
    /// Host address to bind on, defaults to all interfaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PortMappingProtocol>,
}

/// Cluster-wide networking options.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_family: Option<IpFamily>,
    /// Host address the API server listens on, defaults to 127.0.0.1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_address: Option<String>,
    /// Host port the API server listens on, defaults to a random port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_subnet: Option<String>,
    /// Disable kindnetd so that another CNI can be installed.
    #[serde(rename = "disableDefaultCNI", skip_serializing_if = "Option::is_none")]
    pub disable_default_cni: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kube_proxy_mode: Option<ProxyMode>,
}

/// Reference to the [`ProviderConfig`] a managed resource uses.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct ProviderConfigReference {
    pub name: String,
}

/// Reference to a provider config of a given kind.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct TypedProviderConfigReference {
    pub name: String,
    /// Kind of the referenced config, only "ProviderConfig" is served by this provider.
    #[serde(default = "provider_config_kind")]
    pub kind: String,
}

fn provider_config_kind() -> String {
    PROVIDER_CONFIG_KIND.to_string()
}

/// Reference to the Secret connection details are written to.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

/// Reference to a Secret in the namespace of the referencing object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
pub struct LocalSecretReference {
    pub name: String,
}

/// A KIND (Kubernetes IN Docker) cluster running on the Docker daemon of the provider's host.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kind.crossplane.io",
    version = "v1alpha1",
    kind = "Cluster",
    derive = "PartialEq",
    status = "ClusterStatus",
    category = "crossplane",
    category = "managed",
    category = "kind",
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"
    }"#,
    printcolumn = r#"{
        "name":"Synced",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Synced\")].status"
    }"#,
    printcolumn = r#"{
        "name":"External-Name",
        "type": "string",
        "jsonPath": ".metadata.annotations.crossplane\\.io/external-name"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub for_provider: ClusterParameters,
    /// The [`ProviderConfig`] to use, defaults to "default".
    #[serde(rename = "providerConfigRef", skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<ProviderConfigReference>,
    /// Secret to write the kubeconfig of the cluster to.
    #[serde(
        rename = "writeConnectionSecretToRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub write_connection_secret_to_ref: Option<SecretReference>,
    /// Whether to delete the KIND cluster together with this object, defaults to "Delete".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    /// Actions the provider may take on the KIND cluster, defaults to all of them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_policies: Option<Vec<ManagementAction>>,
}

/// Observed state of a KIND node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum NodeStatus {
    Running,
    Unknown,
}

/// Observed state of a KIND cluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObservation {
    /// Whether the cluster has at least one node and all nodes are running.
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_endpoint: Option<String>,
}

/// Observed state of a KIND node.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeObservation {
    /// Name of the node's Docker container.
    pub name: String,
    pub role: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    /// Only populated for IPv6 or dual-stack clusters.
    #[serde(default, rename = "ipv6Address", skip_serializing_if = "String::is_empty")]
    pub ipv6_address: String,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub at_provider: ClusterObservation,
}

impl ClusterStatus {
    /// Set condition `c`, replacing any condition of the same type. The transition
    /// time is only touched if the condition actually changed.
    pub fn update_condition(&mut self, mut c: Condition) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_else(|| vec![]);
        let changed = match conditions.iter().find(|existing| existing.type_ == c.type_) {
            Some(existing) => !existing.same_state(&c),
            None => true,
        };
        if changed {
            let time = Utc::now();
            c.last_transition_time = Some(time.to_rfc3339_opts(SecondsFormat::Secs, true));
            conditions.retain(|v| v.type_ != c.type_);
            conditions.push(c);
        }
        self.conditions = Some(conditions);
    }

    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions.iter().flatten().find(|c| c.type_ == tpe)
    }
}

/// A KIND cluster, living in the namespace of its owner.
///
/// Connection details go to a Secret in the same namespace and there is no deletion
/// policy, deletion is governed by the management policies alone.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kind.m.crossplane.io",
    version = "v1alpha1",
    kind = "Cluster",
    root = "NamespacedCluster",
    namespaced,
    derive = "PartialEq",
    status = "ClusterStatus",
    category = "crossplane",
    category = "managed",
    category = "kind",
    printcolumn = r#"{
        "name":"Ready",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"
    }"#,
    printcolumn = r#"{
        "name":"Synced",
        "type": "string",
        "jsonPath": ".status.conditions[?(@.type==\"Synced\")].status"
    }"#,
    printcolumn = r#"{
        "name":"External-Name",
        "type": "string",
        "jsonPath": ".metadata.annotations.crossplane\\.io/external-name"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedClusterSpec {
    pub for_provider: ClusterParameters,
    /// The provider config to use, defaults to the ProviderConfig "default".
    #[serde(rename = "providerConfigRef", skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<TypedProviderConfigReference>,
    /// Secret in the namespace of this object to write the kubeconfig of the cluster to.
    #[serde(
        rename = "writeConnectionSecretToRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub write_connection_secret_to_ref: Option<LocalSecretReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management_policies: Option<Vec<ManagementAction>>,
}

fn policies(policies: &Option<Vec<ManagementAction>>) -> &[ManagementAction] {
    match policies {
        Some(p) if !p.is_empty() => p.as_slice(),
        _ => FULL_CONTROL,
    }
}

/// A managed resource backed by a KIND cluster, either a [`Cluster`] or a
/// [`NamespacedCluster`].
pub trait ManagedCluster: Send + Sync {
    fn object_meta(&self) -> &ObjectMeta;
    fn object_meta_mut(&mut self) -> &mut ObjectMeta;
    fn parameters(&self) -> &ClusterParameters;
    fn provider_config(&self) -> TypedProviderConfigReference;
    fn deletion_policy(&self) -> DeletionPolicy;
    /// The management policies, all actions if none are set.
    fn management_policies(&self) -> &[ManagementAction];
    /// The Secret to publish connection details to, if any.
    fn connection_secret(&self) -> Option<SecretReference>;
    fn cluster_status(&self) -> Option<&ClusterStatus>;
    fn cluster_status_mut(&mut self) -> &mut ClusterStatus;

    /// Name, prefixed with the namespace for namespaced resources.
    fn id(&self) -> String {
        let meta = self.object_meta();
        let name = meta.name.clone().unwrap_or_default();
        match &meta.namespace {
            Some(ns) => format!("{}/{}", ns, name),
            None => name,
        }
    }

    fn allows(&self, action: ManagementAction) -> bool {
        self.management_policies()
            .iter()
            .any(|a| *a == ManagementAction::All || *a == action)
    }

    /// The external name annotation, `None` if not yet assigned.
    fn external_name(&self) -> Option<&str> {
        self.object_meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(EXTERNAL_NAME_ANNOTATION))
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn set_external_name(&mut self, name: &str) {
        self.object_meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(EXTERNAL_NAME_ANNOTATION.to_string(), name.to_string());
    }

    fn provider_config_name(&self) -> String {
        self.provider_config().name
    }

    fn update_condition(&mut self, c: Condition) {
        self.cluster_status_mut().update_condition(c);
    }

    fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.cluster_status().and_then(|s| s.condition(tpe))
    }

    /// Replace the observed state of the KIND cluster.
    fn set_at_provider(&mut self, observation: ClusterObservation) {
        self.cluster_status_mut().at_provider = observation;
    }

    fn at_provider(&self) -> Option<&ClusterObservation> {
        self.cluster_status().map(|s| &s.at_provider)
    }
}

impl ManagedCluster for Cluster {
    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn parameters(&self) -> &ClusterParameters {
        &self.spec.for_provider
    }

    fn provider_config(&self) -> TypedProviderConfigReference {
        TypedProviderConfigReference {
            name: self
                .spec
                .provider_config_ref
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_else(|| DEFAULT_PROVIDER_CONFIG.to_string()),
            kind: provider_config_kind(),
        }
    }

    fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }

    fn management_policies(&self) -> &[ManagementAction] {
        policies(&self.spec.management_policies)
    }

    fn connection_secret(&self) -> Option<SecretReference> {
        self.spec.write_connection_secret_to_ref.clone()
    }

    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }

    fn cluster_status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(ClusterStatus::default)
    }
}

impl ManagedCluster for NamespacedCluster {
    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn parameters(&self) -> &ClusterParameters {
        &self.spec.for_provider
    }

    fn provider_config(&self) -> TypedProviderConfigReference {
        self.spec
            .provider_config_ref
            .clone()
            .unwrap_or_else(|| TypedProviderConfigReference {
                name: DEFAULT_PROVIDER_CONFIG.to_string(),
                kind: provider_config_kind(),
            })
    }

    fn deletion_policy(&self) -> DeletionPolicy {
        DeletionPolicy::Delete
    }

    fn management_policies(&self) -> &[ManagementAction] {
        policies(&self.spec.management_policies)
    }

    fn connection_secret(&self) -> Option<SecretReference> {
        let namespace = self.metadata.namespace.clone()?;
        self.spec
            .write_connection_secret_to_ref
            .as_ref()
            .map(|r| SecretReference {
                name: r.name.clone(),
                namespace,
            })
    }

    fn cluster_status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }

    fn cluster_status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(ClusterStatus::default)
    }
}

/// Configures how the provider reaches its KIND backend. The local Docker daemon
/// needs no credentials, so the only supported source is "None".
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kind.crossplane.io",
    version = "v1alpha1",
    kind = "ProviderConfig",
    derive = "PartialEq",
    status = "ProviderConfigStatus",
    category = "crossplane",
    category = "provider",
    category = "kind",
    printcolumn = r#"{
        "name":"Users",
        "type": "integer",
        "jsonPath": ".status.users"
    }"#
)]
pub struct ProviderConfigSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProviderCredentials>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct ProviderCredentials {
    /// Credentials source, only "None" is supported.
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct ProviderConfigStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Number of managed resources using this ProviderConfig.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<i64>,
}

impl ProviderConfigStatus {
    pub fn update_condition(&mut self, c: Condition) {
        let mut status = ClusterStatus {
            conditions: self.conditions.take(),
            at_provider: Default::default(),
        };
        status.update_condition(c);
        self.conditions = status.conditions;
    }
}

/// Reference to the managed resource using a [`ProviderConfig`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Records that a managed resource uses a [`ProviderConfig`], which blocks deletion of
/// the [`ProviderConfig`] as long as the usage exists.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kind.crossplane.io",
    version = "v1alpha1",
    kind = "ProviderConfigUsage",
    derive = "PartialEq",
    category = "crossplane",
    category = "provider",
    category = "kind",
    printcolumn = r#"{
        "name":"Config-Name",
        "type": "string",
        "jsonPath": ".spec.providerConfigRef.name"
    }"#,
    printcolumn = r#"{
        "name":"Resource-Name",
        "type": "string",
        "jsonPath": ".spec.resourceRef.name"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigUsageSpec {
    pub provider_config_ref: ProviderConfigReference,
    pub resource_ref: ResourceReference,
}

/// Records that a [`NamespacedCluster`] uses a provider config, kept in the namespace of
/// the [`NamespacedCluster`].
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kind.m.crossplane.io",
    version = "v1alpha1",
    kind = "ProviderConfigUsage",
    root = "NamespacedProviderConfigUsage",
    namespaced,
    derive = "PartialEq",
    category = "crossplane",
    category = "provider",
    category = "kind",
    printcolumn = r#"{
        "name":"Config-Name",
        "type": "string",
        "jsonPath": ".spec.providerConfigRef.name"
    }"#,
    printcolumn = r#"{
        "name":"Resource-Kind",
        "type": "string",
        "jsonPath": ".spec.resourceRef.kind"
    }"#,
    printcolumn = r#"{
        "name":"Resource-Name",
        "type": "string",
        "jsonPath": ".spec.resourceRef.name"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedProviderConfigUsageSpec {
    pub provider_config_ref: TypedProviderConfigReference,
    pub resource_ref: ResourceReference,
}
