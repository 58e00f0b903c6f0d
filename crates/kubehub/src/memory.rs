//! In-memory [`ResourceClient`] that behaves like a tiny API server:
//! assigns uid and resourceVersion, rejects stale replaces and duplicate
//! creates, and records mutations in call order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleetsync_core::{labels::matches_labels, Error, Result};
use kube::core::{DynamicObject, ErrorResponse, GroupVersionKind};

use crate::{gvk_key, ResourceClient};

/// A recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { kind: String, namespace: Option<String>, name: String },
    Replace { kind: String, namespace: Option<String>, name: String },
    Delete { kind: String, namespace: Option<String>, name: String },
}

impl Call {
    pub fn verb(&self) -> &'static str {
        match self {
            Call::Create { .. } => "create",
            Call::Replace { .. } => "replace",
            Call::Delete { .. } => "delete",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Call::Create { name, .. } | Call::Replace { name, .. } | Call::Delete { name, .. } => name,
        }
    }
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    calls: Vec<Call>,
    reads: usize,
    next_rv: u64,
    fail_next: Option<(u16, String)>,
}

#[derive(Default)]
pub struct MemoryResourceClient {
    state: Mutex<State>,
}

fn key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Key {
    (gvk_key(gvk), namespace.unwrap_or("").to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    kube::Error::Api(ErrorResponse { status: "Failure".into(), message, reason: reason.into(), code }).into()
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as if it already existed, without recording a call.
    pub fn seed(&self, gvk: &GroupVersionKind, mut obj: DynamicObject) {
        let mut st = self.state();
        st.next_rv += 1;
        obj.metadata.resource_version = Some(st.next_rv.to_string());
        let name = obj.metadata.name.clone().unwrap_or_default();
        let k = key(gvk, obj.metadata.namespace.as_deref(), &name);
        st.objects.insert(k, obj);
    }

    /// Fail the next mutation with an API error of the given status code.
    pub fn fail_next(&self, code: u16, message: impl Into<String>) {
        self.state().fail_next = Some((code, message.into()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    pub fn stored(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.state().objects.get(&key(gvk, namespace, name)).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate(&self, call: Call) -> Result<MutexGuard<'_, State>> {
        let mut st = self.state();
        if let Some((code, message)) = st.fail_next.take() {
            return Err(api_error(code, "Injected", message));
        }
        st.calls.push(call);
        Ok(st)
    }
}

fn addr(obj: &DynamicObject) -> Result<(Option<String>, String)> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::structural(fleetsync_core::describe(obj), None, "missing metadata.name"))?;
    Ok((obj.metadata.namespace.clone(), name))
}

#[async_trait::async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get_opt(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        let mut st = self.state();
        st.reads += 1;
        Ok(st.objects.get(&key(gvk, namespace, name)).cloned())
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<DynamicObject>> {
        let mut st = self.state();
        st.reads += 1;
        let kind = gvk_key(gvk);
        let ns = namespace.filter(|n| !n.is_empty());
        Ok(st
            .objects
            .iter()
            .filter(|((k, n, _), _)| *k == kind && ns.map(|want| want == n.as_str()).unwrap_or(true))
            .map(|(_, o)| o)
            .filter(|o| matches_labels(*o, label_selector.unwrap_or("")))
            .cloned()
            .collect())
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = addr(obj)?;
        let k = key(gvk, namespace.as_deref(), &name);
        let mut st = self.mutate(Call::Create { kind: gvk.kind.clone(), namespace, name: name.clone() })?;
        if st.objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{} {:?} already exists", gvk.kind, name)));
        }
        st.next_rv += 1;
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(st.next_rv.to_string());
        stored.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", st.next_rv));
        st.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = addr(obj)?;
        let k = key(gvk, namespace.as_deref(), &name);
        let mut st = self.mutate(Call::Replace { kind: gvk.kind.clone(), namespace, name: name.clone() })?;
        let live_rv = match st.objects.get(&k) {
            Some(live) => live.metadata.resource_version.clone(),
            None => return Err(api_error(404, "NotFound", format!("{} {:?} not found", gvk.kind, name))),
        };
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != live_rv {
            return Err(api_error(409, "Conflict", format!("{} {:?} has been modified", gvk.kind, name)));
        }
        st.next_rv += 1;
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(st.next_rv.to_string());
        st.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<()> {
        let k = key(gvk, namespace, name);
        let mut st = self.mutate(Call::Delete {
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        })?;
        st.objects.remove(&k);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, ns: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns, "labels": labels}
        }))
        .unwrap()
    }

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn create_get_and_duplicate() {
        let c = MemoryResourceClient::new();
        let created = c.create(&gvk(), &cm("a", "ns", serde_json::json!({}))).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(c.get_opt(&gvk(), Some("ns"), "a").await.unwrap().is_some());
        assert!(c.get_opt(&gvk(), Some("other"), "a").await.unwrap().is_none());

        let err = c.create(&gvk(), &cm("a", "ns", serde_json::json!({}))).await.unwrap_err();
        assert!(err.is_retryable(), "{}", err);
        assert_eq!(c.mutation_count(), 2);
    }

    #[tokio::test]
    async fn replace_checks_resource_version() {
        let c = MemoryResourceClient::new();
        c.seed(&gvk(), cm("a", "ns", serde_json::json!({})));
        let mut stale = cm("a", "ns", serde_json::json!({}));
        stale.metadata.resource_version = Some("99".into());
        assert!(c.replace(&gvk(), &stale).await.is_err());

        let mut fresh = cm("a", "ns", serde_json::json!({"v": "2"}));
        fresh.metadata.resource_version = Some("1".into());
        let out = c.replace(&gvk(), &fresh).await.unwrap();
        assert_eq!(out.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let c = MemoryResourceClient::new();
        c.seed(&gvk(), cm("a", "ns1", serde_json::json!({"app": "x"})));
        c.seed(&gvk(), cm("b", "ns2", serde_json::json!({"app": "x"})));
        c.seed(&gvk(), cm("c", "ns1", serde_json::json!({"app": "y"})));
        assert_eq!(c.list(&gvk(), None, Some("app=x")).await.unwrap().len(), 2);
        assert_eq!(c.list(&gvk(), Some("ns1"), None).await.unwrap().len(), 2);
        assert_eq!(c.list(&gvk(), Some("ns1"), Some("app=x")).await.unwrap().len(), 1);
        assert!(c.calls().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_hits_next_mutation_only() {
        let c = MemoryResourceClient::new();
        c.fail_next(503, "broker unavailable");
        let err = c.create(&gvk(), &cm("a", "ns", serde_json::json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("broker unavailable"), "{}", err);
        assert!(c.is_empty());
        c.create(&gvk(), &cm("a", "ns", serde_json::json!({}))).await.unwrap();
        assert_eq!(c.calls().iter().map(Call::verb).collect::<Vec<_>>(), vec!["create"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let c = MemoryResourceClient::new();
        c.delete(&gvk(), Some("ns"), "missing").await.unwrap();
        c.seed(&gvk(), cm("a", "ns", serde_json::json!({})));
        c.delete(&gvk(), Some("ns"), "a").await.unwrap();
        assert!(c.stored(&gvk(), Some("ns"), "a").is_none());
    }
}
