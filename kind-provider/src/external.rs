use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use kind_provider_apis::{
    Cluster, ClusterObservation, Condition, ManagedCluster, NamespacedCluster, NodeStatus,
    PROVIDER_CONFIG_KIND,
};
use kube::config::Kubeconfig;

use crate::{
    errors::ControllerError,
    kind::{CreateOptions, ImageLookup, KindBackend, NULL_DEVICE},
    kind_config::project,
    managed::{
        ConnectionDetails, ExternalClient, ExternalConnecter, ExternalCreation, ExternalDelete,
        ExternalObservation, ExternalUpdate, KUBECONFIG_KEY, Managed,
    },
    node_inspector::NodeInspector,
    usage::{UsageRecord, UsageTracker},
};

fn as_cluster(mg: &mut dyn Managed) -> Result<&mut dyn ManagedCluster, ControllerError> {
    let any = mg.as_any_mut();
    if any.is::<Cluster>() {
        any.downcast_mut::<Cluster>()
            .map(|c| c as &mut dyn ManagedCluster)
            .ok_or(ControllerError::NotCluster)
    } else {
        any.downcast_mut::<NamespacedCluster>()
            .map(|c| c as &mut dyn ManagedCluster)
            .ok_or(ControllerError::NotCluster)
    }
}

/// The name of the KIND cluster backing `cr`: its external name, or its own name if
/// no external name has been assigned yet.
fn cluster_name(cr: &dyn ManagedCluster) -> String {
    cr.external_name()
        .map(|v| v.to_string())
        .unwrap_or_else(|| cr.object_meta().name.clone().unwrap_or_default())
}

fn parse_wait(wait: Option<&str>) -> Result<Option<Duration>, ControllerError> {
    wait.map(|v| humantime::parse_duration(v.trim()))
        .transpose()
        .map_err(ControllerError::ParseWait)
}

/// The server of the first cluster entry of `kubeconfig`.
fn api_server_endpoint(kubeconfig: &str) -> Option<String> {
    match Kubeconfig::from_yaml(kubeconfig) {
        Ok(config) => config
            .clusters
            .into_iter()
            .find_map(|c| c.cluster.and_then(|c| c.server)),
        Err(e) => {
            debug!("cannot parse kubeconfig: {}", e);
            None
        }
    }
}

fn connection_details(kubeconfig: String) -> ConnectionDetails {
    [(KUBECONFIG_KEY.to_string(), kubeconfig.into_bytes())].into()
}

/// Creates a [`KindExternal`] client for every reconcile of a [`Cluster`].
pub(crate) struct Connector {
    usage: Arc<dyn UsageTracker>,
    backend: Arc<dyn KindBackend>,
    images: Arc<dyn ImageLookup>,
}

impl Connector {
    pub fn new(
        usage: Arc<dyn UsageTracker>,
        backend: Arc<dyn KindBackend>,
        images: Arc<dyn ImageLookup>,
    ) -> Self {
        Self {
            usage,
            backend,
            images,
        }
    }
}

#[async_trait]
impl ExternalConnecter for Connector {
    async fn connect(&self, mg: &dyn Managed) -> Result<Box<dyn ExternalClient>, ControllerError> {
        let record = UsageRecord::of(mg).ok_or(ControllerError::NotCluster)?;
        let provider_config = match &record {
            UsageRecord::Cluster(u) => u.spec.provider_config_ref.name.clone(),
            UsageRecord::Namespaced(u) => {
                if u.spec.provider_config_ref.kind != PROVIDER_CONFIG_KIND {
                    return Err(ControllerError::UnsupportedProviderConfig(
                        u.spec.provider_config_ref.kind.clone(),
                    ));
                }
                u.spec.provider_config_ref.name.clone()
            }
        };
        // Blocks deletion of the ProviderConfig while the managed resource exists.
        self.usage
            .track(&record)
            .await
            .map_err(ControllerError::TrackUsage)?;
        debug!(
            "{} {} uses ProviderConfig {}",
            record.resource_ref().kind,
            record.resource_ref().name,
            provider_config
        );
        Ok(Box::new(KindExternal::new(
            self.backend.clone(),
            self.images.clone(),
        )))
    }
}

/// [`ExternalClient`] managing one KIND cluster.
pub(crate) struct KindExternal {
    backend: Arc<dyn KindBackend>,
    images: Arc<dyn ImageLookup>,
}

impl KindExternal {
    pub fn new(backend: Arc<dyn KindBackend>, images: Arc<dyn ImageLookup>) -> Self {
        Self { backend, images }
    }
}

#[async_trait]
impl ExternalClient for KindExternal {
    async fn observe(&self, mg: &mut dyn Managed) -> Result<ExternalObservation, ControllerError> {
        let cr = as_cluster(mg)?;
        let name = cluster_name(cr);

        let clusters = self
            .backend
            .list_clusters()
            .await
            .map_err(ControllerError::ListClusters)?;
        if !clusters.iter().any(|c| c == &name) {
            return Ok(ExternalObservation {
                resource_exists: false,
                ..Default::default()
            });
        }

        let kubeconfig = self
            .backend
            .kubeconfig(&name)
            .await
            .map_err(ControllerError::GetKubeConfig)?;
        let api_server_endpoint = api_server_endpoint(&kubeconfig);

        let nodes = self
            .backend
            .list_nodes(&name)
            .await
            .map_err(ControllerError::GetNodes)?;
        let inspector = NodeInspector::new(self.backend.as_ref(), self.images.as_ref());
        let mut observations = Vec::with_capacity(nodes.len());
        for node in &nodes {
            observations.push(inspector.inspect(node).await);
        }
        let ready = !observations.is_empty()
            && observations
                .iter()
                .all(|n| n.status == NodeStatus::Running);

        cr.set_at_provider(ClusterObservation {
            ready,
            nodes: observations,
            api_server_endpoint,
        });
        cr.update_condition(if ready {
            Condition::available()
        } else {
            Condition::unavailable()
        });

        Ok(ExternalObservation {
            resource_exists: true,
            // KIND clusters cannot be changed after creation, see `update`.
            resource_up_to_date: true,
            connection_details: connection_details(kubeconfig),
        })
    }

    async fn create(&self, mg: &mut dyn Managed) -> Result<ExternalCreation, ControllerError> {
        let cr = as_cluster(mg)?;
        cr.update_condition(Condition::creating());

        let name = cluster_name(cr);
        cr.set_external_name(&name);

        let config = project(cr.parameters());
        let wait_for_ready = parse_wait(cr.parameters().wait_for_ready.as_deref())?;

        self.backend
            .create_cluster(
                &name,
                CreateOptions {
                    config,
                    wait_for_ready,
                    kubeconfig_path: NULL_DEVICE.into(),
                },
            )
            .await
            .map_err(ControllerError::CreateCluster)?;
        info!("created KIND cluster {} for {}", name, cr.id());

        let kubeconfig = self
            .backend
            .kubeconfig(&name)
            .await
            .map_err(ControllerError::GetKubeConfig)?;
        Ok(ExternalCreation {
            connection_details: connection_details(kubeconfig),
        })
    }

    /// Node topology and networking of a KIND cluster are fixed at creation time, so
    /// there is nothing to update. Changing them requires deleting the Cluster.
    async fn update(&self, mg: &mut dyn Managed) -> Result<ExternalUpdate, ControllerError> {
        as_cluster(mg)?;
        Ok(ExternalUpdate::default())
    }

    async fn delete(&self, mg: &mut dyn Managed) -> Result<ExternalDelete, ControllerError> {
        let cr = as_cluster(mg)?;
        cr.update_condition(Condition::deleting());
        let name = cluster_name(cr);
        self.backend
            .delete_cluster(&name, Path::new(NULL_DEVICE))
            .await
            .map_err(ControllerError::DeleteCluster)?;
        info!("deleted KIND cluster {} of {}", name, cr.id());
        Ok(ExternalDelete::default())
    }

    async fn disconnect(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}
