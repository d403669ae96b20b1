use async_trait::async_trait;
use kind_provider_apis::{
    Cluster, ManagedCluster, NamespacedCluster, NamespacedProviderConfigUsage,
    NamespacedProviderConfigUsageSpec, PROVIDER_CONFIG_LABEL, ProviderConfigReference,
    ProviderConfigUsage, ProviderConfigUsageSpec, ResourceReference,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, Patch, PatchParams},
};

#[cfg(test)]
use mockall::automock;

use crate::{MANAGER, errors::ExtKubeApiError, managed::Managed};

/// The usage record of one managed resource, scoped like the resource itself.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum UsageRecord {
    Cluster(ProviderConfigUsage),
    Namespaced(NamespacedProviderConfigUsage),
}

impl UsageRecord {
    /// The usage record of `mg`, `None` if it is no managed KIND cluster.
    pub(crate) fn of(mg: &dyn Managed) -> Option<Self> {
        let any = mg.as_any();
        if let Some(cluster) = any.downcast_ref::<Cluster>() {
            Some(UsageRecord::Cluster(usage_for(cluster)))
        } else {
            any.downcast_ref::<NamespacedCluster>()
                .map(|cluster| UsageRecord::Namespaced(namespaced_usage_for(cluster)))
        }
    }

    pub(crate) fn resource_ref(&self) -> &ResourceReference {
        match self {
            UsageRecord::Cluster(u) => &u.spec.resource_ref,
            UsageRecord::Namespaced(u) => &u.spec.resource_ref,
        }
    }
}

/// Registry of the managed resources using a `ProviderConfig`.
///
/// Every managed resource owns exactly one usage record, so concurrent registrations of
/// different resources never overwrite each other and registering twice is a no-op.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait UsageTracker: Send + Sync {
    /// Store `record`.
    async fn track(&self, record: &UsageRecord) -> Result<(), kube::Error>;

    /// Remove `record`, if it exists.
    async fn release(&self, record: &UsageRecord) -> Result<(), kube::Error>;
}

/// Name of the usage record of `cluster`, stable across renames of its ProviderConfig.
fn usage_name<K: Resource>(cluster: &K) -> String {
    cluster.uid().unwrap_or_else(|| cluster.name_any())
}

fn resource_ref<K: Resource<DynamicType = ()>>(cluster: &K) -> ResourceReference {
    ResourceReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: cluster.name_any(),
    }
}

/// Label the usage with its provider config and let it be garbage collected with
/// `cluster` should the finalizer be removed by hand.
fn label_and_own<U, K>(usage: &mut U, cluster: &K)
where
    U: Resource,
    K: Resource<DynamicType = ()> + ManagedCluster,
{
    usage
        .labels_mut()
        .insert(PROVIDER_CONFIG_LABEL.to_string(), cluster.provider_config_name());
    if let Some(owner) = cluster.controller_owner_ref(&()) {
        usage.owner_references_mut().push(owner);
    }
}

pub(crate) fn usage_for(cluster: &Cluster) -> ProviderConfigUsage {
    let mut usage = ProviderConfigUsage::new(
        usage_name(cluster).as_str(),
        ProviderConfigUsageSpec {
            provider_config_ref: ProviderConfigReference {
                name: cluster.provider_config_name(),
            },
            resource_ref: resource_ref(cluster),
        },
    );
    label_and_own(&mut usage, cluster);
    usage
}

pub(crate) fn namespaced_usage_for(cluster: &NamespacedCluster) -> NamespacedProviderConfigUsage {
    let mut usage = NamespacedProviderConfigUsage::new(
        usage_name(cluster).as_str(),
        NamespacedProviderConfigUsageSpec {
            provider_config_ref: cluster.provider_config(),
            resource_ref: resource_ref(cluster),
        },
    );
    usage.metadata.namespace = cluster.namespace();
    label_and_own(&mut usage, cluster);
    usage
}

/// [`UsageTracker`] storing usage objects via server-side apply.
pub(crate) struct KubeUsageTracker {
    client: Client,
}

impl KubeUsageTracker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api(
        &self,
        usage: &NamespacedProviderConfigUsage,
    ) -> Api<NamespacedProviderConfigUsage> {
        match usage.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl UsageTracker for KubeUsageTracker {
    async fn track(&self, record: &UsageRecord) -> Result<(), kube::Error> {
        let pp = PatchParams::apply(MANAGER).force();
        match record {
            UsageRecord::Cluster(usage) => {
                let api: Api<ProviderConfigUsage> = Api::all(self.client.clone());
                api.patch(usage.name_any().as_str(), &pp, &Patch::Apply(usage))
                    .await?;
            }
            UsageRecord::Namespaced(usage) => {
                self.namespaced_api(usage)
                    .patch(usage.name_any().as_str(), &pp, &Patch::Apply(usage))
                    .await?;
            }
        }
        Ok(())
    }

    async fn release(&self, record: &UsageRecord) -> Result<(), kube::Error> {
        let dp = DeleteParams::default();
        match record {
            UsageRecord::Cluster(usage) => {
                let api: Api<ProviderConfigUsage> = Api::all(self.client.clone());
                ignore_not_found(api.delete(usage.name_any().as_str(), &dp).await)
            }
            UsageRecord::Namespaced(usage) => {
                let api = self.namespaced_api(usage);
                ignore_not_found(api.delete(usage.name_any().as_str(), &dp).await)
            }
        }
    }
}
