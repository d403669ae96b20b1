use crate::{
    Configuration,
    cluster_modifications::ClusterModifications,
    errors::{ControllerError, ExtKubeApiError},
    managed::{ConnectionDetails, ExternalClient, ExternalConnecter, ManagedKind},
    usage::{UsageRecord, UsageTracker},
    utils::metric_name,
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kind_provider_apis::{
    API_GROUP, Condition, DeletionPolicy, ManagedCluster, ManagementAction, SecretReference,
};
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, Patch, PatchParams},
};
use kube_runtime::{
    controller::{self, Action, Controller},
    watcher,
};
use log::{debug, info};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};

/// Finalizer keeping a managed cluster around until its KIND cluster is deleted.
///
/// Note, changing the finalizer name is a breaking change, objects carrying the old
/// finalizer could not be deleted anymore.
pub(crate) const FINALIZER: &'static str = "finalizer.managedresource.crossplane.io";

/// Writes of the reconcile driver to the API server.
#[async_trait]
pub(crate) trait ClusterStore<K: ManagedKind>: Send + Sync {
    /// Persist local changes to everything but the status.
    async fn patch_spec(&self, event: &mut ClusterModifications<K>) -> Result<(), ControllerError>;

    /// Write `details` to the connection Secret of `cr`, if it has one.
    async fn publish_connection_details(
        &self,
        cr: &K,
        details: ConnectionDetails,
    ) -> Result<(), ControllerError>;
}

pub(crate) struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K: ManagedKind> ClusterStore<K> for KubeClusterStore {
    async fn patch_spec(&self, event: &mut ClusterModifications<K>) -> Result<(), ControllerError> {
        event.patch_spec(self.client.clone()).await
    }

    async fn publish_connection_details(
        &self,
        cr: &K,
        details: ConnectionDetails,
    ) -> Result<(), ControllerError> {
        let reference = match cr.connection_secret() {
            Some(reference) if !details.is_empty() => reference,
            _ => return Ok(()),
        };
        let secret = connection_secret(cr, &reference, details);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), reference.namespace.as_str());
        api.patch(
            reference.name.as_str(),
            &PatchParams::apply(crate::MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        debug!(
            "published connection details of {} to {}/{}",
            cr.id(),
            reference.namespace,
            reference.name
        );
        Ok(())
    }
}

/// The steps of one reconcile against a connected [`ExternalClient`].
pub(crate) struct Reconciler<K: ManagedKind> {
    store: Arc<dyn ClusterStore<K>>,
    usage: Arc<dyn UsageTracker>,
}

impl<K: ManagedKind> Reconciler<K> {
    pub fn new(store: Arc<dyn ClusterStore<K>>, usage: Arc<dyn UsageTracker>) -> Self {
        Self { store, usage }
    }

    async fn add_finalizer_if_missing(
        &self,
        event: &mut ClusterModifications<K>,
    ) -> Result<(), ControllerError> {
        if !event.has_finalizer(FINALIZER) {
            event.meta_mut().finalizers.get_or_insert_with(Vec::new).push(FINALIZER.to_string());
            self.store.patch_spec(event).await?;
        }
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        event: &mut ClusterModifications<K>,
    ) -> Result<(), ControllerError> {
        if let Some(finalizers) = event.meta_mut().finalizers.as_mut() {
            let original_size = finalizers.len();
            finalizers.retain(|f| f.as_str() != FINALIZER);
            if finalizers.len() != original_size {
                self.store.patch_spec(event).await?;
            }
        }
        Ok(())
    }

    /// Run the observe/create/update cycle for an existing managed cluster.
    pub async fn check(
        &self,
        event: &mut ClusterModifications<K>,
        external: &dyn ExternalClient,
    ) -> Result<(), ControllerError> {
        self.add_finalizer_if_missing(event).await?;
        let observation = external.observe(event.cluster_mut()).await?;
        let details = if !observation.resource_exists {
            if !event.allows(ManagementAction::Create) {
                return Err(ControllerError::CreateNotAllowed);
            }
            let creation = external.create(event.cluster_mut()).await;
            // Persist the external name even if the creation failed, the next
            // reconcile has to look for the very same KIND cluster.
            self.store.patch_spec(event).await?;
            creation?.connection_details
        } else if !observation.resource_up_to_date && event.allows(ManagementAction::Update) {
            let mut details = observation.connection_details;
            details.extend(external.update(event.cluster_mut()).await?.connection_details);
            details
        } else {
            observation.connection_details
        };
        self.store
            .publish_connection_details(&event.modified, details)
            .await
    }

    pub async fn delete(
        &self,
        event: &mut ClusterModifications<K>,
        external: &dyn ExternalClient,
    ) -> Result<(), ControllerError> {
        if event.deletion_policy() == DeletionPolicy::Delete
            && event.allows(ManagementAction::Delete)
        {
            let observation = external.observe(event.cluster_mut()).await?;
            if observation.resource_exists {
                external.delete(event.cluster_mut()).await?;
            }
        } else {
            info!("orphaning KIND cluster of {}", event.id());
        }
        let record = UsageRecord::of(&event.modified).ok_or(ControllerError::NotCluster)?;
        self.usage.release(&record).await?;
        self.remove_finalizer(event).await
    }
}

/// Drives managed clusters of kind `K` towards their KIND clusters through the
/// [`ExternalConnecter`] contract.
pub(crate) struct ClusterController<K: ManagedKind> {
    configuration: Configuration,
    connector: Arc<dyn ExternalConnecter>,
    reconciler: Reconciler<K>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
}

impl<K: ManagedKind> ClusterController<K> {
    pub fn new(
        configuration: Configuration,
        connector: Arc<dyn ExternalConnecter>,
        usage: Arc<dyn UsageTracker>,
    ) -> Self {
        let kind = K::kind(&());
        let meter: Meter = global::meter(K::CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name(format!("{}_reconcile_count", K::CONTROLLER).as_str()))
            .with_description(format!("Count of {} reconcile invocations", kind))
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name(
                format!("{}_reconcile_duration_ms", K::CONTROLLER).as_str(),
            ))
            .with_description(format!("Reconcile duration of {} objects in milliseconds", kind))
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name(format!("{}_reconcile_errors", K::CONTROLLER).as_str()))
            .with_description(format!("Count of reconcile invocation errors for {} resources", kind))
            .build();
        let store = Arc::new(KubeClusterStore::new(configuration.client.clone()));
        Self {
            configuration,
            connector,
            reconciler: Reconciler::new(store, usage),
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    async fn reconcile_with(
        &self,
        event: &mut ClusterModifications<K>,
    ) -> Result<(), ControllerError> {
        let external = self.connector.connect(&event.modified).await?;
        let result = if event.is_deleted() {
            self.reconciler.delete(event, external.as_ref()).await
        } else {
            self.reconciler.check(event, external.as_ref()).await
        };
        external.disconnect().await?;
        result
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile(object: Arc<K>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let mut event = ClusterModifications::new(object.as_ref().clone());
        if event.is_deleted() && !event.has_finalizer(FINALIZER) {
            return Ok(Action::await_change());
        }
        let start = Instant::now();
        let result = me.reconcile_with(&mut event).await;
        let labels = &[KeyValue::new("cluster", event.id())];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(start.elapsed().as_millis() as u64, labels);
        match result {
            Ok(()) if event.is_deleted() => Ok(Action::await_change()),
            Ok(()) => {
                event.update_condition(Condition::reconcile_success());
                event.replace_status(me.client()).await?;
                Ok(Action::requeue(me.configuration.poll_interval))
            }
            Err(e) => {
                me.reconcile_errors.add(1, labels);
                event.update_condition(Condition::reconcile_error(format!("{}", e)));
                if let Err(status_error) = event.replace_status(me.client()).await {
                    warn!(
                        "cannot record reconcile error of {}: {}",
                        event.id(),
                        status_error
                    );
                }
                Err(e)
            }
        }
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(_object: Arc<K>, error: &ControllerError, _ctx: Arc<Self>) -> Action {
        match error {
            ControllerError::KubeApi(e) if e.is_conflict() => Action::requeue(Duration::from_secs(1)),
            e if e.is_temporary() => Action::requeue(Duration::from_secs(30)),
            _ => Action::requeue(Duration::from_secs(300)),
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let config = controller::Config::default()
            .concurrency(self.configuration.max_reconcile_rate);
        let controller = Controller::new(K::api(self.client(), None), watcher::Config::default())
            .with_config(config);
        controller
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => match e {
                        a @ kube_runtime::controller::Error::QueueError { .. } => {
                            debug!("reconcile failed: {:?}", a);
                            // Slow down on errors caused by missing CRDs or permissions.
                            sleep(Duration::from_secs(30)).await;
                        }
                        a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                            debug!("reconcile failed: {:?}", a);
                        }
                        e => {
                            warn!("reconcile failed: {:?}", e);
                        }
                    },
                }
            })
    }
}

/// The Secret holding the connection details of `cr`, owned by `cr`.
fn connection_secret<K: ManagedKind>(
    cr: &K,
    reference: &SecretReference,
    details: ConnectionDetails,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(reference.name.clone()),
            namespace: Some(reference.namespace.clone()),
            owner_references: cr.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(
            details
                .into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        type_: Some(format!("connection.{}/v1alpha1", API_GROUP)),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        external::KindExternal,
        kind::{
            MockImageLookup,
            fake::{FakeKind, FakeNode},
        },
        managed::KUBECONFIG_KEY,
        usage::MockUsageTracker,
    };
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
    use kind_provider_apis::{
        Cluster, ClusterParameters, ClusterSpec, LocalSecretReference, NamespacedCluster,
        NamespacedClusterSpec, Node, NodeRole,
    };
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    enum StoreCall {
        Patch {
            external_name: Option<String>,
            finalizers: Vec<String>,
        },
        Publish(Vec<String>),
    }

    /// [`ClusterStore`] recording what would have been written.
    #[derive(Default)]
    struct FakeStore {
        calls: Mutex<Vec<StoreCall>>,
    }

    impl FakeStore {
        fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<K: ManagedKind> ClusterStore<K> for FakeStore {
        async fn patch_spec(
            &self,
            event: &mut ClusterModifications<K>,
        ) -> Result<(), ControllerError> {
            if event.spec_patch()?.is_some() {
                self.calls.lock().unwrap().push(StoreCall::Patch {
                    external_name: event.external_name().map(|v| v.to_string()),
                    finalizers: event.meta().finalizers.clone().unwrap_or_default(),
                });
                let persisted = event.modified.clone();
                event.accept(persisted)?;
            }
            Ok(())
        }

        async fn publish_connection_details(
            &self,
            _cr: &K,
            details: ConnectionDetails,
        ) -> Result<(), ControllerError> {
            self.calls
                .lock()
                .unwrap()
                .push(StoreCall::Publish(details.into_keys().collect()));
            Ok(())
        }
    }

    fn cluster(deletion_policy: Option<DeletionPolicy>) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                uid: Some("1234".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                for_provider: ClusterParameters {
                    nodes: vec![Node {
                        role: Some(NodeRole::ControlPlane),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                provider_config_ref: None,
                write_connection_secret_to_ref: Some(SecretReference {
                    name: "demo-kubeconfig".to_string(),
                    namespace: "crossplane-system".to_string(),
                }),
                deletion_policy,
                management_policies: None,
            },
            status: None,
        }
    }

    fn deleted(mut cr: Cluster) -> Cluster {
        cr.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cr.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cr
    }

    fn external(backend: &Arc<FakeKind>) -> KindExternal {
        let mut images = MockImageLookup::new();
        images
            .expect_lookup_image()
            .returning(|_| "kindest/node:v1.33.1".to_string());
        KindExternal::new(backend.clone(), Arc::new(images))
    }

    fn releasing(times: usize) -> MockUsageTracker {
        let mut usage = MockUsageTracker::new();
        usage
            .expect_release()
            .withf(|r| r.resource_ref().name == "demo")
            .times(times)
            .returning(|_| Ok(()));
        usage
    }

    fn reconciler<K: ManagedKind>(
        store: &Arc<FakeStore>,
        usage: MockUsageTracker,
    ) -> Reconciler<K> {
        Reconciler::new(store.clone(), Arc::new(usage))
    }

    fn running(name: &str) -> Arc<FakeKind> {
        Arc::new(FakeKind::default().with_cluster(
            name,
            vec![FakeNode::running(
                &format!("{}-control-plane", name),
                "control-plane",
                "172.18.0.2",
            )],
        ))
    }

    fn finalizer_removed() -> StoreCall {
        StoreCall::Patch {
            external_name: None,
            finalizers: vec![],
        }
    }

    #[tokio::test]
    async fn orphan_skips_delete() {
        let backend = running("demo");
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(deleted(cluster(Some(DeletionPolicy::Orphan))));
        reconciler(&store, releasing(1))
            .delete(&mut event, &external(&backend))
            .await
            .unwrap();
        assert!(backend.calls().is_empty());
        assert!(backend.cluster("demo").is_some());
        assert_eq!(vec![finalizer_removed()], store.calls());
        assert!(!event.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn delete_removes_existing_cluster() {
        let backend = running("demo");
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(deleted(cluster(None)));
        reconciler(&store, releasing(1))
            .delete(&mut event, &external(&backend))
            .await
            .unwrap();
        assert_eq!(Some(&"delete demo".to_string()), backend.calls().last());
        assert!(backend.cluster("demo").is_none());
        assert_eq!(vec![finalizer_removed()], store.calls());
    }

    #[tokio::test]
    async fn deleting_absent_cluster_only_releases_usage() {
        let backend = Arc::new(FakeKind::default());
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(deleted(cluster(None)));
        reconciler(&store, releasing(1))
            .delete(&mut event, &external(&backend))
            .await
            .unwrap();
        assert_eq!(vec!["list"], backend.calls());
        assert_eq!(vec![finalizer_removed()], store.calls());
    }

    #[tokio::test]
    async fn management_policies_without_delete_orphan() {
        let backend = running("demo");
        let store = Arc::new(FakeStore::default());
        let mut cr = deleted(cluster(None));
        cr.spec.management_policies = Some(vec![
            ManagementAction::Observe,
            ManagementAction::Create,
        ]);
        let mut event = ClusterModifications::new(cr);
        reconciler(&store, releasing(1))
            .delete(&mut event, &external(&backend))
            .await
            .unwrap();
        assert!(backend.calls().is_empty());
        assert_eq!(vec![finalizer_removed()], store.calls());
    }

    #[tokio::test]
    async fn failed_delete_keeps_finalizer() {
        let backend = Arc::new(
            FakeKind::default()
                .with_cluster("demo", vec![])
                .failing("delete"),
        );
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(deleted(cluster(None)));
        match reconciler(&store, releasing(0))
            .delete(&mut event, &external(&backend))
            .await
        {
            Err(ControllerError::DeleteCluster(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(store.calls().is_empty());
        assert!(event.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn failed_create_persists_external_name() {
        let backend = Arc::new(FakeKind::default().failing("create"));
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(cluster(None));
        match reconciler(&store, releasing(0))
            .check(&mut event, &external(&backend))
            .await
        {
            Err(ControllerError::CreateCluster(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            vec![
                StoreCall::Patch {
                    external_name: None,
                    finalizers: vec![FINALIZER.to_string()],
                },
                StoreCall::Patch {
                    external_name: Some("demo".to_string()),
                    finalizers: vec![FINALIZER.to_string()],
                },
            ],
            store.calls()
        );
    }

    #[tokio::test]
    async fn external_name_is_persisted_before_publishing() {
        let backend = Arc::new(FakeKind::default());
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(cluster(None));
        reconciler(&store, releasing(0))
            .check(&mut event, &external(&backend))
            .await
            .unwrap();
        assert_eq!(
            vec![
                StoreCall::Patch {
                    external_name: None,
                    finalizers: vec![FINALIZER.to_string()],
                },
                StoreCall::Patch {
                    external_name: Some("demo".to_string()),
                    finalizers: vec![FINALIZER.to_string()],
                },
                StoreCall::Publish(vec![KUBECONFIG_KEY.to_string()]),
            ],
            store.calls()
        );
        assert!(backend.cluster("demo").is_some());
    }

    #[tokio::test]
    async fn existing_cluster_is_observed_and_published() {
        let backend = running("demo");
        let store = Arc::new(FakeStore::default());
        let mut cr = cluster(None);
        cr.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        let mut event = ClusterModifications::new(cr);
        reconciler(&store, releasing(0))
            .check(&mut event, &external(&backend))
            .await
            .unwrap();
        assert!(!backend.calls().iter().any(|c| c.starts_with("create")));
        assert_eq!(
            vec![StoreCall::Publish(vec![KUBECONFIG_KEY.to_string()])],
            store.calls()
        );
        assert!(event.at_provider().unwrap().ready);
    }

    #[tokio::test]
    async fn observe_only_policy_never_creates() {
        let backend = Arc::new(FakeKind::default());
        let store = Arc::new(FakeStore::default());
        let mut cr = cluster(None);
        cr.spec.management_policies = Some(vec![ManagementAction::Observe]);
        let mut event = ClusterModifications::new(cr);
        match reconciler(&store, releasing(0))
            .check(&mut event, &external(&backend))
            .await
        {
            Err(ControllerError::CreateNotAllowed) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(vec!["list"], backend.calls());
        assert_eq!(None, event.external_name());
    }

    #[tokio::test]
    async fn namespaced_cluster_is_created() {
        let backend = Arc::new(FakeKind::default());
        let store = Arc::new(FakeStore::default());
        let mut event = ClusterModifications::new(NamespacedCluster {
            metadata: ObjectMeta {
                name: Some("dev".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            spec: NamespacedClusterSpec {
                for_provider: Default::default(),
                provider_config_ref: None,
                write_connection_secret_to_ref: Some(LocalSecretReference {
                    name: "dev-kubeconfig".to_string(),
                }),
                management_policies: None,
            },
            status: None,
        });
        reconciler(&store, MockUsageTracker::new())
            .check(&mut event, &external(&backend))
            .await
            .unwrap();
        assert_eq!(Some("dev"), event.external_name());
        assert_eq!(
            Some(&StoreCall::Publish(vec![KUBECONFIG_KEY.to_string()])),
            store.calls().last()
        );
    }

    #[test]
    fn connection_secret_holds_kubeconfig() {
        let cr = cluster(None);
        let reference = cr.connection_secret().unwrap();
        let details: ConnectionDetails =
            [(KUBECONFIG_KEY.to_string(), b"apiVersion: v1".to_vec())].into();
        let secret = connection_secret(&cr, &reference, details);
        assert_eq!(Some("demo-kubeconfig".to_string()), secret.metadata.name);
        assert_eq!(
            Some("crossplane-system".to_string()),
            secret.metadata.namespace
        );
        let data = secret.data.unwrap();
        assert_eq!(1, data.len());
        assert_eq!(b"apiVersion: v1".to_vec(), data[KUBECONFIG_KEY].0);
        assert_eq!(
            "1234",
            secret.metadata.owner_references.unwrap()[0].uid
        );
        assert_eq!(
            Some("connection.kind.crossplane.io/v1alpha1".to_string()),
            secret.type_
        );
    }

    #[test]
    fn conflicts_are_retried_quickly() {
        let conflict = ControllerError::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(conflict.is_temporary());
        assert!(matches!(conflict, ControllerError::KubeApi(ref e) if e.is_conflict()));
    }
}
