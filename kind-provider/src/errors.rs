use crate::kind::BackendError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The managed resource handed to the external client is not a `Cluster`.
    #[error("managed resource is not a Cluster custom resource")]
    NotCluster,
    /// Failed to register the `ProviderConfigUsage` of a managed resource.
    #[error("cannot track ProviderConfig usage: {0}")]
    TrackUsage(#[source] kube::Error),
    #[error("cannot list KIND clusters: {0}")]
    ListClusters(#[source] BackendError),
    #[error("cannot get kubeconfig for KIND cluster: {0}")]
    GetKubeConfig(#[source] BackendError),
    #[error("cannot list KIND cluster nodes: {0}")]
    GetNodes(#[source] BackendError),
    /// `waitForReady` is not a valid duration, nothing was sent to the backend.
    #[error("cannot parse waitForReady duration: {0}")]
    ParseWait(#[source] humantime::DurationError),
    /// The KIND cluster might exist partially, no rollback is attempted.
    #[error("cannot create KIND cluster: {0}")]
    CreateCluster(#[source] BackendError),
    #[error("cannot delete KIND cluster: {0}")]
    DeleteCluster(#[source] BackendError),
    /// The managed resource references a provider config kind this provider does not serve.
    #[error("unsupported provider config kind {0}")]
    UnsupportedProviderConfig(String),
    /// The KIND cluster is missing and the management policies forbid creating it.
    #[error("KIND cluster does not exist and management policies do not allow creating it")]
    CreateNotAllowed,
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::NotCluster | ControllerError::UnsupportedProviderConfig(_) => false,
            _ => true,
        }
    }
}
