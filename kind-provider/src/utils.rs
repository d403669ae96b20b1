use json_patch::diff;
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

pub(crate) async fn add_finalizer_if_missing<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let original = source.clone();
    let finalizers = source.finalizers_mut();
    if !finalizers.iter().any(|f| f.as_str() == finalizer) {
        finalizers.push(finalizer.to_string());
        let patch = diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&source)?,
        );
        *source = api
            .patch(
                source.name_any().as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<T>::Json(patch),
            )
            .await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub(crate) async fn remove_finalizer<T>(
    api: Api<T>,
    source: &mut T,
    finalizer: &str,
) -> Result<bool, ControllerError>
where
    T: Clone + std::fmt::Debug + Serialize + DeserializeOwned + Resource,
{
    let original = source.clone();
    let finalizers = source.finalizers_mut();
    let len = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    if finalizers.len() != len {
        // JSON Patch, as server-side apply would not remove a finalizer added by another
        // field manager.
        let patch = diff(
            &serde_json::to_value(&original)?,
            &serde_json::to_value(&source)?,
        );
        match api
            .patch(
                source.name_any().as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<T>::Json(patch),
            )
            .await
        {
            Ok(_) => (),
            Err(e) if e.is_not_found() => (),
            Err(e) => Err(e)?,
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

pub(crate) fn metric_name(name: &str) -> String {
    format!("kind_provider_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        assert_eq!("kind_provider_reconcile_count", metric_name("reconcile_count"));
    }
}
