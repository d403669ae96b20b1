use crate::{
    Configuration,
    errors::ControllerError,
    utils::{add_finalizer_if_missing, metric_name, remove_finalizer},
};

use futures::StreamExt;
use kind_provider_apis::{
    Condition, NamespacedProviderConfigUsage, PROVIDER_CONFIG_KIND, PROVIDER_CONFIG_LABEL,
    ProviderConfig, ProviderConfigUsage,
};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, Patch, PatchParams},
};
use kube_runtime::{
    controller::{Action, Controller},
    watcher,
};
use log::{debug, info};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use serde_json::json;
use std::{future::Future, sync::Arc};
use tokio::time::Duration;

/// Finalizer blocking deletion of a [`ProviderConfig`] while managed resources use it.
pub(crate) const IN_USE_FINALIZER: &'static str = "in-use.crossplane.io";

const PROVIDER_CONFIG_CONTROLLER: &'static str = "provider_config_controller";

/// Counts the `ProviderConfigUsage` objects of every [`ProviderConfig`] and holds
/// back its deletion until no managed resource uses it anymore.
pub(crate) struct ProviderConfigController {
    configuration: Configuration,
    reconcile_count: Counter<u64>,
}

/// Label selector matching the usages of the ProviderConfig `name`.
fn usage_selector(name: &str) -> String {
    format!("{}={}", PROVIDER_CONFIG_LABEL, name)
}

/// The ProviderConfig a namespaced usage counts towards, `None` for other kinds of
/// provider configs.
fn provider_config_of(
    usage: &NamespacedProviderConfigUsage,
) -> Option<kube_runtime::reflector::ObjectRef<ProviderConfig>> {
    let reference = &usage.spec.provider_config_ref;
    (reference.kind == PROVIDER_CONFIG_KIND)
        .then(|| kube_runtime::reflector::ObjectRef::new(reference.name.as_str()))
}

impl ProviderConfigController {
    pub fn new(configuration: Configuration) -> Self {
        let meter: Meter = global::meter(PROVIDER_CONFIG_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("provider_config_reconcile_count"))
            .with_description("Count of ProviderConfig reconcile invocations")
            .build();
        Self {
            configuration,
            reconcile_count,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    /// Number of cluster-scoped and namespaced usages of the ProviderConfig `name`.
    async fn users(&self, name: &str) -> Result<i64, ControllerError> {
        let lp = ListParams::default().labels(usage_selector(name).as_str());
        let usages: Api<ProviderConfigUsage> = Api::all(self.client());
        let namespaced: Api<NamespacedProviderConfigUsage> = Api::all(self.client());
        let cluster_users = usages.list_metadata(&lp).await?.items.len();
        let namespaced_users = namespaced
            .list(&lp)
            .await?
            .items
            .iter()
            .filter_map(provider_config_of)
            .count();
        Ok((cluster_users + namespaced_users) as i64)
    }

    /// Record the number of users, and why deletion is blocked if it is.
    async fn update_status(
        &self,
        pc: &ProviderConfig,
        users: i64,
        blocker: Option<Condition>,
    ) -> Result<(), ControllerError> {
        let mut status = pc.status.clone().unwrap_or_default();
        status.users = Some(users);
        if let Some(condition) = blocker {
            status.update_condition(condition);
        }
        if pc.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let api = self.configuration.provider_configs.clone();
        api.patch_status(
            pc.name_any().as_str(),
            &PatchParams {
                field_manager: Some(crate::MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn reconcile(
        object: Arc<ProviderConfig>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let mut pc = object.as_ref().clone();
        let name = pc.name_any();
        me.reconcile_count
            .add(1, &[KeyValue::new("provider_config", name.clone())]);
        let api = me.configuration.provider_configs.clone();
        let users = me.users(name.as_str()).await?;
        if pc.metadata.deletion_timestamp.is_some() {
            if users > 0 {
                info!(
                    "ProviderConfig {} is still used by {} managed resources",
                    name, users
                );
                me.update_status(&pc, users, Some(Condition::in_use(users)))
                    .await?;
                return Ok(Action::requeue(Duration::from_secs(30)));
            }
            remove_finalizer(api, &mut pc, IN_USE_FINALIZER).await?;
            return Ok(Action::await_change());
        }
        if add_finalizer_if_missing(api, &mut pc, IN_USE_FINALIZER).await? {
            debug!("added finalizer to ProviderConfig {}", name);
        }
        me.update_status(&pc, users, None).await?;
        Ok(Action::requeue(me.configuration.poll_interval))
    }

    fn error_policy(
        _object: Arc<ProviderConfig>,
        error: &ControllerError,
        _ctx: Arc<Self>,
    ) -> Action {
        if error.is_temporary() {
            Action::requeue(Duration::from_secs(30))
        } else {
            Action::requeue(Duration::from_secs(300))
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let usages: Api<ProviderConfigUsage> = Api::all(self.client());
        let namespaced_usages: Api<NamespacedProviderConfigUsage> = Api::all(self.client());
        Controller::new(
            self.configuration.provider_configs.clone(),
            watcher::Config::default(),
        )
        // A usage change re-counts the users of the referenced ProviderConfig.
        .watches(usages, watcher::Config::default(), |usage| {
            Some(kube_runtime::reflector::ObjectRef::new(
                usage.spec.provider_config_ref.name.as_str(),
            ))
        })
        .watches(namespaced_usages, watcher::Config::default(), |usage| {
            provider_config_of(&usage)
        })
        .run(Self::reconcile, Self::error_policy, Arc::new(self))
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {:?}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_usages_by_provider_config_label() {
        assert_eq!(
            "kind.crossplane.io/provider-config=default",
            usage_selector("default")
        );
    }

    fn namespaced_usage(kind: &str) -> NamespacedProviderConfigUsage {
        let mut usage = NamespacedProviderConfigUsage::new(
            "5678",
            kind_provider_apis::NamespacedProviderConfigUsageSpec {
                provider_config_ref: kind_provider_apis::TypedProviderConfigReference {
                    name: "local".to_string(),
                    kind: kind.to_string(),
                },
                resource_ref: kind_provider_apis::ResourceReference {
                    api_version: "kind.m.crossplane.io/v1alpha1".to_string(),
                    kind: "Cluster".to_string(),
                    name: "dev".to_string(),
                },
            },
        );
        usage.metadata.namespace = Some("team-a".to_string());
        usage
    }

    #[test]
    fn namespaced_usages_count_towards_their_provider_config() {
        let target = provider_config_of(&namespaced_usage(PROVIDER_CONFIG_KIND)).unwrap();
        assert_eq!("local", target.name);
        assert_eq!(None, target.namespace);
        assert!(provider_config_of(&namespaced_usage("ClusterProviderConfig")).is_none());
    }
}
