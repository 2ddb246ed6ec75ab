//! Resource store backed by the Kubernetes API server

use std::collections::HashMap;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    core::{ApiResource, GroupVersionKind},
    discovery::{self, Scope},
    Api, Client, ResourceExt,
};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ObjectRef, ResourceStore};
use crate::error::{Error, Result};

/// Discovered API resource and whether it is namespaced
#[derive(Clone)]
struct Resolved {
    resource: ApiResource,
    namespaced: bool,
}

/// [`ResourceStore`] talking to the API server through `Api<DynamicObject>`
///
/// Each group/version/kind is resolved through discovery once and cached.
pub struct KubeStore {
    client: Client,
    resolved: RwLock<HashMap<GroupVersionKind, Resolved>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Resolved> {
        if let Some(resolved) = self.resolved.read().await.get(gvk) {
            return Ok(resolved.clone());
        }

        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "Discovering API resource");
        let (resource, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let resolved = Resolved {
            resource,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        };
        self.resolved
            .write()
            .await
            .insert(gvk.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(&self, key: &ObjectRef) -> Result<Api<DynamicObject>> {
        let resolved = self.resolve(&key.gvk).await?;
        let api = match (&key.namespace, resolved.namespaced) {
            (Some(ns), true) => {
                Api::namespaced_with(self.client.clone(), ns, &resolved.resource)
            }
            (None, true) => {
                return Err(Error::malformed(format!(
                    "{} is namespaced but no namespace was given",
                    key
                )))
            }
            (_, false) => Api::all_with(self.client.clone(), &resolved.resource),
        };
        Ok(api)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ObjectRef) -> Result<Option<DynamicObject>> {
        let api = self.api(key).await?;
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::from_object(obj)?;
        let api = self.api(&key).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &key.to_string()))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectRef::from_object(obj)?;
        let api = self.api(&key).await?;
        api.replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &key.to_string()))
    }

    async fn patch_merge(
        &self,
        key: &ObjectRef,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let api = self.api(key).await?;
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from_kube(e, &key.to_string()))
    }

    async fn delete(&self, key: &ObjectRef) -> Result<bool> {
        let api = self.api(key).await?;
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(Error::from_kube(e, &key.to_string())),
        }
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.resolve(gvk).await?.namespaced)
    }
}
