//! fleetsync kubehub: the dynamic-object client seam both backends talk through.
//!
//! [`KubeResourceClient`] resolves kinds against a live API server; the
//! [`memory::MemoryResourceClient`] keeps objects in RAM and records every
//! mutation, which the backend tests assert on.

#![forbid(unsafe_code)]

pub mod memory;

use std::collections::HashMap;

use fleetsync_core::{Error, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use tokio::sync::RwLock;
use tracing::debug;

pub use memory::{Call, MemoryResourceClient};

/// CRUD over dynamic objects addressed by GVK. Implementations must be safe
/// for concurrent use and must not retry.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// `None` when the object does not exist.
    async fn get_opt(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>>;

    /// `namespace: None` lists across all namespaces.
    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<DynamicObject>>;

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Full replace; `obj.metadata.resourceVersion` guards against lost updates.
    async fn replace(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Returns once the API accepted the deletion; a missing object is not an error.
    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(Error::structural(
            format!("gvk key {:?}", key),
            None,
            "expected v1/Kind or group/v1/Kind",
        )),
    }
}

/// kube-rs backed client. Resolved kinds are cached for the client's lifetime.
pub struct KubeResourceClient {
    client: Client,
    resolved: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: RwLock::new(HashMap::new()) }
    }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.resolved.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, plural = %ar.plural, namespaced, "kind resolved");
        self.resolved.write().await.insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        let client = self.client.clone();
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) if !ns.is_empty() => Api::namespaced_with(client, ns, &ar),
            (true, _) => Api::default_namespaced_with(client, &ar),
            (false, _) => Api::all_with(client, &ar),
        })
    }

    async fn list_api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        let client = self.client.clone();
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) if !ns.is_empty() => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        })
    }
}

fn name_of(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::structural(fleetsync_core::describe(obj), None, "missing metadata.name"))
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_opt(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        let api = self.api(gvk, namespace).await?;
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<DynamicObject>> {
        let api = self.list_api(gvk, namespace).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector.filter(|s| !s.is_empty()) {
            lp = lp.labels(sel);
        }
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(gvk, obj.metadata.namespace.as_deref()).await?;
        Ok(api.replace(name_of(obj)?, &PostParams::default(), obj).await?)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let api = self.api(gvk, namespace).await?;
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
