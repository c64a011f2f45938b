//! Create-or-update and delete for objects of any kind
//!
//! Objects are applied with server-side apply after resolving their kind
//! through API discovery, so foreign CRDs need no compiled-in types.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use trellis_common::kube_utils::FIELD_MANAGER;
use trellis_common::{Error, Result};

/// Ensure collaborator used by controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicHelper: Send + Sync {
    /// Create or update every object to match the given form
    async fn ensure(&self, objects: &[DynamicObject]) -> Result<()>;

    /// Delete the named object; absence is success
    async fn ensure_deleted(&self, kind: &str, namespace: &str, name: &str) -> Result<()>;
}

/// [`DynamicHelper`] backed by the Kubernetes API
pub struct KubeDynamicHelper {
    client: Client,
}

impl KubeDynamicHelper {
    /// Create a helper using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn discover(&self) -> Result<Discovery> {
        Ok(Discovery::new(self.client.clone()).run().await?)
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

/// Split an object's `apiVersion` and `kind` into a GVK
fn gvk_of(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object.types.as_ref().ok_or_else(|| {
        Error::validation_for_field("apiVersion", format!("{} has no type", object.name_any()))
    })?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

#[async_trait]
impl DynamicHelper for KubeDynamicHelper {
    async fn ensure(&self, objects: &[DynamicObject]) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }

        let discovery = self.discover().await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for object in objects {
            let gvk = gvk_of(object)?;
            let name = object.metadata.name.as_deref().ok_or_else(|| {
                Error::validation_for_field("metadata.name", format!("{} object has no name", gvk.kind))
            })?;
            let (resource, _) = discovery
                .resolve_gvk(&gvk)
                .ok_or_else(|| Error::not_found("resource type", format!("{}/{}", gvk.group, gvk.kind)))?;

            self.api(&resource, object.metadata.namespace.as_deref())
                .patch(name, &params, &Patch::Apply(object))
                .await?;
            debug!(kind = %gvk.kind, name = %name, "applied object");
        }

        Ok(())
    }

    async fn ensure_deleted(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let discovery = self.discover().await?;
        let resource = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .map(|(resource, _)| resource)
            .find(|resource| resource.kind == kind)
            .ok_or_else(|| Error::not_found("resource type", kind))?;

        match self
            .api(&resource, Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(kind, name, "deleted object");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
