use crate::{MANAGER, errors::ControllerError, managed::ManagedKind};
use json_patch::{PatchOperation, diff};
use kind_provider_apis::ManagedCluster;
use kube::ResourceExt;
use kube::api::PostParams;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
};
use serde_json::{Value, json};
use std::ops::DerefMut;

/// Helper construct to simplify updating and patching managed KIND clusters.
///
/// `original` is the object as last read from or written to the API server, `modified`
/// carries the local changes of the running reconcile.
pub(crate) struct ClusterModifications<K: ManagedKind> {
    original: K,
    pub modified: K,
}

impl<K: ManagedKind> std::ops::Deref for ClusterModifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K: ManagedKind> DerefMut for ClusterModifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

/// `object` without the fields the driver never patches.
fn spec_value<K: ManagedKind>(object: &K) -> Result<Value, ControllerError> {
    let mut value = serde_json::to_value(object)?;
    if let Some(o) = value.as_object_mut() {
        o.remove("status");
    }
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
        metadata.remove("managedFields");
    }
    Ok(value)
}

impl<K: ManagedKind> ClusterModifications<K> {
    pub(crate) fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn cluster_mut(&mut self) -> &mut K {
        &mut self.modified
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub(crate) fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f.as_str() == finalizer)
    }

    fn api(&self, client: Client) -> Api<K> {
        K::api(client, self.modified.meta().namespace.as_deref())
    }

    /// Take `persisted` as the new server state, keeping the local status for a later
    /// [`Self::replace_status`].
    pub(crate) fn accept(&mut self, persisted: K) -> Result<(), ControllerError> {
        let mut modified = serde_json::to_value(&persisted)?;
        if let Some(o) = modified.as_object_mut() {
            match serde_json::to_value(self.modified.cluster_status())? {
                Value::Null => o.remove("status"),
                status => o.insert("status".to_string(), status),
            };
        }
        self.modified = serde_json::from_value(modified)?;
        self.original = persisted;
        Ok(())
    }

    fn status_has_changed(&self) -> bool {
        self.original.cluster_status() != self.modified.cluster_status()
    }

    pub(crate) async fn replace_status(&mut self, client: Client) -> Result<(), ControllerError> {
        if self.status_has_changed() {
            Ok(self._replace_status(client).await?)
        } else {
            Ok(())
        }
    }

    async fn _replace_status(&mut self, client: Client) -> kube::Result<()> {
        let api = self.api(client);
        let name = self.modified.name_any();
        let latest = api.get_status(name.as_str()).await?;
        self.modified.meta_mut().resource_version = latest.meta().resource_version.clone();
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        self.modified = api
            .replace_status(
                name.as_str(),
                &pp,
                serde_json::to_vec(&self.modified).map_err(|e| kube::Error::SerdeError(e))?,
            )
            .await?;
        self.original = self.modified.clone();
        Ok(())
    }

    /// JSON patch of the local changes to everything but the status.
    ///
    /// The patch only carries what this reconcile changed and is rejected if the object
    /// was written since it was read.
    pub(crate) fn spec_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let mut patch = diff(&spec_value(&self.original)?, &spec_value(&self.modified)?);
        if patch.0.is_empty() {
            return Ok(None);
        }
        if let Some(rv) = &self.original.meta().resource_version {
            let test: PatchOperation = serde_json::from_value(json!({
                "op": "test",
                "path": "/metadata/resourceVersion",
                "value": rv,
            }))?;
            patch.0.insert(0, test);
        }
        Ok(Some(patch))
    }

    /// Patch everything but the status, keeping local status changes for a later
    /// [`Self::replace_status`].
    pub(crate) async fn patch_spec(&mut self, client: Client) -> Result<(), ControllerError> {
        match self.spec_patch()? {
            Some(patch) => self._patch_spec(client, patch).await,
            None => Ok(()),
        }
    }

    async fn _patch_spec(
        &mut self,
        client: Client,
        patch: json_patch::Patch,
    ) -> Result<(), ControllerError> {
        let name = self.modified.name_any();
        let api = self.api(client);
        let patch_txt = serde_json::to_string(&patch)?;
        let response = api
            .patch(
                name.as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<json_patch::Patch>::Json(patch),
            )
            .await;
        debug!(
            "Patch object {} ({:?}) with {} -> {:?}",
            self.modified.id(),
            self.original.resource_version(),
            patch_txt,
            response.as_ref().map(|c| c.resource_version())
        );
        self.accept(response?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kind_provider_apis::{
        Cluster, ClusterParameters, ClusterSpec, Condition, LocalSecretReference,
        NamespacedCluster, NamespacedClusterSpec, ProxyMode,
    };
    use kube::api::ObjectMeta;
    use kube::Resource;

    fn cluster(resource_version: &str) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            spec: ClusterSpec {
                for_provider: Default::default(),
                provider_config_ref: None,
                write_connection_secret_to_ref: None,
                deletion_policy: None,
                management_policies: None,
            },
            status: None,
        }
    }

    fn modifications() -> ClusterModifications<Cluster> {
        ClusterModifications::new(cluster("1"))
    }

    fn spec_has_changed<K: ManagedKind>(event: &ClusterModifications<K>) -> bool {
        event.spec_patch().unwrap().is_some()
    }

    #[test]
    fn status_changes_are_not_spec_changes() {
        let mut event = modifications();
        assert!(!spec_has_changed(&event));
        assert!(!event.status_has_changed());
        event.update_condition(Condition::available());
        assert!(!spec_has_changed(&event));
        assert!(event.status_has_changed());
    }

    #[test]
    fn external_name_is_a_spec_change() {
        let mut event = modifications();
        event.cluster_mut().set_external_name("demo");
        assert!(spec_has_changed(&event));
        assert!(!event.status_has_changed());
    }

    #[test]
    fn spec_patch_is_pinned_to_the_read_resource_version() {
        let mut event = modifications();
        event.cluster_mut().set_external_name("demo");
        let patch = serde_json::to_value(event.spec_patch().unwrap().unwrap()).unwrap();
        let ops = patch.as_array().unwrap();
        assert_eq!(
            json!({"op": "test", "path": "/metadata/resourceVersion", "value": "1"}),
            ops[0]
        );
        assert_eq!(2, ops.len());
        assert_eq!("add", ops[1]["op"]);
        assert_eq!("/metadata/annotations", ops[1]["path"]);
    }

    #[test]
    fn spec_patch_keeps_concurrent_edits() {
        let mut event = modifications();
        event.cluster_mut().set_external_name("demo");
        // Meanwhile somebody else switched the proxy mode, the object is at rv 2 now.
        let mut latest = cluster("2");
        latest.spec.for_provider = ClusterParameters {
            kube_proxy_mode: Some(ProxyMode::Ipvs),
            ..Default::default()
        };
        let patch = event.spec_patch().unwrap().unwrap();
        let text = serde_json::to_string(&patch).unwrap();
        assert!(!text.contains("forProvider"), "{}", text);
        assert!(!text.contains("\"remove\""), "{}", text);

        // Applied to the latest object the test op rejects the write.
        let mut target = serde_json::to_value(&latest).unwrap();
        assert!(json_patch::patch(&mut target, &patch).is_err());
        // Applied to the object it was computed from, only the annotation is added.
        let mut target = serde_json::to_value(cluster("1")).unwrap();
        json_patch::patch(&mut target, &patch).unwrap();
        let patched: Cluster = serde_json::from_value(target).unwrap();
        assert_eq!(Some("demo"), patched.external_name());
        assert_eq!(cluster("1").spec, patched.spec);
    }

    #[test]
    fn accept_keeps_local_status() {
        let mut event = modifications();
        event.update_condition(Condition::available());
        event.cluster_mut().set_external_name("demo");
        let mut persisted = cluster("2");
        persisted.set_external_name("demo");
        event.accept(persisted.clone()).unwrap();
        assert!(!spec_has_changed(&event));
        assert!(event.status_has_changed());
        assert_eq!(Some("2"), event.meta().resource_version.as_deref());
        assert_eq!(persisted.spec, event.spec);
        assert!(event.condition(kind_provider_apis::CONDITION_READY).is_some());
    }

    #[test]
    fn accept_without_local_status_drops_server_status() {
        let mut event = modifications();
        let mut persisted = cluster("2");
        persisted.update_condition(Condition::available());
        event.accept(persisted).unwrap();
        assert_eq!(None, event.status);
        assert!(event.status_has_changed());
    }

    #[test]
    fn namespaced_cluster_changes() {
        let mut event = ClusterModifications::new(NamespacedCluster {
            metadata: ObjectMeta {
                name: Some("dev".to_string()),
                namespace: Some("team-a".to_string()),
                resource_version: Some("7".to_string()),
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
        event.update_condition(Condition::available());
        assert!(!spec_has_changed(&event));
        event.finalizers_mut().push("a".to_string());
        let patch = serde_json::to_value(event.spec_patch().unwrap().unwrap()).unwrap();
        assert_eq!("7", patch[0]["value"]);
        assert_eq!("team-a/dev", event.id());
    }

    #[test]
    fn finalizers() {
        let mut event = modifications();
        assert!(!event.has_finalizer("a"));
        event.finalizers_mut().push("a".to_string());
        assert!(event.has_finalizer("a"));
        assert!(!event.is_deleted());
    }
}
