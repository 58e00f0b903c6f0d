//! `ManifestWork` envelope used by the broker-mediated transport.
//!
//! The envelope lives in the consumer's namespace on the hub and carries an
//! ordered list of inner manifests under `spec.workload.manifests`.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Resource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{describe, Error, Result, GENERATION_ANNOTATION};

pub const GROUP: &str = "work.open-cluster-management.io";
pub const VERSION: &str = "v1";
pub const KIND: &str = "ManifestWork";
const PLURAL: &str = "manifestworks";
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWork {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ManifestWorkSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<ManifestsTemplate>,
    /// Delete options, manifest configs and other fields passed through as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestsTemplate {
    /// Raw entries; shape is only checked by [`ManifestWork::manifests`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<Vec<Json>>,
}

fn default_api_version() -> String {
    format!("{}/{}", GROUP, VERSION)
}

fn default_kind() -> String {
    KIND.to_string()
}

impl Default for ManifestWork {
    fn default() -> Self {
        Self { api_version: default_api_version(), kind: default_kind(), metadata: ObjectMeta::default(), spec: None, status: None }
    }
}

impl Resource for ManifestWork {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(PLURAL)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ManifestWork {
    pub fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(GROUP, VERSION, KIND)
    }

    /// True when a dynamic object is itself a ManifestWork envelope.
    pub fn is_envelope(obj: &DynamicObject) -> bool {
        crate::has_gvk(obj, &Self::gvk())
    }

    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        let v = serde_json::to_value(obj).map_err(|e| Error::structural(describe(obj), None, e))?;
        serde_json::from_value(v).map_err(|e| Error::structural(describe(obj), None, e))
    }

    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let ctx = || format!("{}/{}", KIND, self.metadata.name.as_deref().unwrap_or("<unnamed>"));
        let v = serde_json::to_value(self).map_err(|e| Error::structural(ctx(), None, e))?;
        serde_json::from_value(v).map_err(|e| Error::structural(ctx(), None, e))
    }

    /// Name of the envelope generated around `manifest`: kind, namespace and
    /// name folded into a DNS-1123 subdomain, so objects sharing a name but
    /// differing in kind or namespace get distinct envelopes.
    pub fn envelope_name(manifest: &DynamicObject) -> String {
        let mut parts = vec![crate::object_kind(manifest)];
        if let Some(ns) = manifest.metadata.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            parts.push(ns);
        }
        parts.push(manifest.metadata.name.as_deref().unwrap_or(""));
        let raw: String = parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("-")
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
                _ => '-',
            })
            .collect();
        let trimmed = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
        while name.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
            name.pop();
        }
        name
    }

    /// Envelope for a single manifest, named by [`Self::envelope_name`] and
    /// carrying its generation annotation and labels.
    pub fn wrap(manifest: &DynamicObject) -> Result<Self> {
        let raw = serde_json::to_value(manifest).map_err(|e| Error::structural(describe(manifest), None, e))?;
        let mut annotations = BTreeMap::new();
        if let Some(gen) = manifest.metadata.annotations.as_ref().and_then(|a| a.get(GENERATION_ANNOTATION)) {
            annotations.insert(GENERATION_ANNOTATION.to_string(), gen.clone());
        }
        Ok(Self {
            metadata: ObjectMeta {
                name: Some(Self::envelope_name(manifest)),
                labels: manifest.metadata.labels.clone(),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ManifestWorkSpec {
                workload: Some(ManifestsTemplate { manifests: Some(vec![raw]) }),
                extra: serde_json::Map::new(),
            }),
            ..Default::default()
        })
    }

    fn raw_manifests(&self) -> &[Json] {
        self.spec
            .as_ref()
            .and_then(|s| s.workload.as_ref())
            .and_then(|w| w.manifests.as_deref())
            .unwrap_or(&[])
    }

    /// Typed view of the embedded manifests in order. Fails on the first
    /// entry that is not an object with metadata, naming its index.
    pub fn manifests(&self) -> Result<Vec<DynamicObject>> {
        let context = format!("{}/{} spec.workload.manifests", KIND, self.metadata.name.as_deref().unwrap_or("<unnamed>"));
        self.raw_manifests()
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                if !entry.is_object() {
                    return Err(Error::structural(context.clone(), Some(i), "entry is not an object"));
                }
                serde_json::from_value::<DynamicObject>(entry.clone())
                    .map_err(|e| Error::structural(context.clone(), Some(i), e))
            })
            .collect()
    }

    pub fn set_manifests(&mut self, manifests: &[DynamicObject]) -> Result<()> {
        let raw = manifests
            .iter()
            .map(|m| serde_json::to_value(m).map_err(|e| Error::structural(describe(m), None, e)))
            .collect::<Result<Vec<_>>>()?;
        let spec = self.spec.get_or_insert_with(ManifestWorkSpec::default);
        spec.workload.get_or_insert_with(ManifestsTemplate::default).manifests = Some(raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    fn cm(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "labels": {"app": "x"}, "annotations": {"fleetsync.io/generation": "4"}},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    #[test]
    fn wrap_copies_generation_and_labels() {
        let w = ManifestWork::wrap(&cm("settings")).unwrap();
        assert_eq!(w.name_any(), "configmap-settings");
        assert_eq!(w.api_version, "work.open-cluster-management.io/v1");
        assert_eq!(w.annotations().get(GENERATION_ANNOTATION).map(String::as_str), Some("4"));
        assert_eq!(w.labels().get("app").map(String::as_str), Some("x"));
        let inner = w.manifests().unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].data["data"]["k"], "v");
    }

    #[test]
    fn envelope_names_separate_kinds_and_namespaces() {
        let obj = |kind: &str, ns: &str, name: &str| -> DynamicObject {
            serde_json::from_value(serde_json::json!({
                "apiVersion": "v1", "kind": kind, "metadata": {"name": name, "namespace": ns}
            }))
            .unwrap()
        };
        let a = ManifestWork::envelope_name(&obj("ConfigMap", "ns", "app"));
        let b = ManifestWork::envelope_name(&obj("Deployment", "ns", "app"));
        let c = ManifestWork::envelope_name(&obj("ConfigMap", "other", "app"));
        assert_eq!(a, "configmap-ns-app");
        assert_eq!(b, "deployment-ns-app");
        assert_ne!(a, c);
        assert_eq!(ManifestWork::envelope_name(&obj("Role", "ns", "system:reader_")), "role-ns-system-reader");
    }

    #[test]
    fn dynamic_round_trip_keeps_extra_spec_fields() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "work.open-cluster-management.io/v1",
            "kind": "ManifestWork",
            "metadata": {"name": "w", "namespace": "c1"},
            "spec": {"deleteOption": {"propagationPolicy": "Orphan"}, "workload": {"manifests": []}}
        }))
        .unwrap();
        assert!(ManifestWork::is_envelope(&obj));
        let w = ManifestWork::from_dynamic(&obj).unwrap();
        assert!(w.spec.as_ref().unwrap().extra.contains_key("deleteOption"));
        let back = w.to_dynamic().unwrap();
        assert_eq!(back.data["spec"]["deleteOption"]["propagationPolicy"], "Orphan");
        assert!(ManifestWork::is_envelope(&back));
    }

    #[test]
    fn manifests_rejects_non_object_entries() {
        let w: ManifestWork = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "w"},
            "spec": {"workload": {"manifests": [{"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}, 42]}}
        }))
        .unwrap();
        let err = w.manifests().unwrap_err().to_string();
        assert!(err.contains("at index 1"), "{}", err);
    }

    #[test]
    fn set_manifests_replaces_list() {
        let mut w = ManifestWork::default();
        w.set_manifests(&[cm("a"), cm("b")]).unwrap();
        let names: Vec<_> = w.manifests().unwrap().iter().map(|m| m.name_any()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
