//! The contract between the reconcile driver and the external resources it manages.
//!
//! For every reconcile the driver asks an [`ExternalConnecter`] for an
//! [`ExternalClient`] and then observes, creates, updates or deletes the external
//! resource through it. Calls for one managed resource are never concurrent.

use std::{any::Any, collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use kind_provider_apis::{Cluster, ManagedCluster, NamespacedCluster};
use kube::{Api, Client, Resource};
use serde::{Serialize, de::DeserializeOwned};

use crate::errors::ControllerError;

/// Connection details of an external resource, published to the connection Secret.
pub(crate) type ConnectionDetails = BTreeMap<String, Vec<u8>>;

/// Key of the kubeconfig in [`ConnectionDetails`].
pub(crate) const KUBECONFIG_KEY: &'static str = "kubeconfig";

/// A Kubernetes object managed by an [`ExternalClient`].
pub(crate) trait Managed: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<K> Managed for K
where
    K: kube::Resource + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A Kubernetes kind of managed KIND clusters the reconcile driver can run for.
pub(crate) trait ManagedKind:
    Resource<DynamicType = ()>
    + ManagedCluster
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Label value telling the metrics of the driver instances apart.
    const CONTROLLER: &'static str;

    /// Api for objects in `namespace`, or in all namespaces.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

impl ManagedKind for Cluster {
    const CONTROLLER: &'static str = "cluster_controller";

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }
}

impl ManagedKind for NamespacedCluster {
    const CONTROLLER: &'static str = "namespaced_cluster_controller";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    pub connection_details: ConnectionDetails,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ExternalCreation {
    pub connection_details: ConnectionDetails,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ExternalUpdate {
    pub connection_details: ConnectionDetails,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct ExternalDelete {}

#[async_trait]
pub(crate) trait ExternalClient: Send + Sync {
    /// Observe the external resource, never changing it.
    async fn observe(&self, mg: &mut dyn Managed) -> Result<ExternalObservation, ControllerError>;

    async fn create(&self, mg: &mut dyn Managed) -> Result<ExternalCreation, ControllerError>;

    async fn update(&self, mg: &mut dyn Managed) -> Result<ExternalUpdate, ControllerError>;

    async fn delete(&self, mg: &mut dyn Managed) -> Result<ExternalDelete, ControllerError>;

    /// Release whatever the client holds, called at the end of every reconcile.
    async fn disconnect(&self) -> Result<(), ControllerError>;
}

#[async_trait]
pub(crate) trait ExternalConnecter: Send + Sync {
    async fn connect(&self, mg: &dyn Managed) -> Result<Box<dyn ExternalClient>, ControllerError>;
}
