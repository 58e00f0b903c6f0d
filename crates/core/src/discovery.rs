//! Discovery abstraction: locating an existing resource (or a manifest
//! nested in an envelope) by exact name or by label selector.

use kube::core::DynamicObject;
use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::envelope::ManifestWork;
use crate::labels::{matches_labels, LabelSelector};
use crate::Result;

/// Capability describing how to find a resource.
pub trait Discovery: Send + Sync {
    /// Namespace filter; empty or `*` means all namespaces.
    fn namespace(&self) -> &str;

    /// Exact name, when discovery targets a single resource.
    fn name(&self) -> Option<&str>;

    /// Canonical `k=v,k=v` selector; empty when no selector is configured.
    fn label_selector(&self) -> String;

    fn is_single_resource(&self) -> bool {
        self.name().is_some()
    }

    /// Namespace to scope backend queries to, `None` for all namespaces.
    fn scoped_namespace(&self) -> Option<&str> {
        match self.namespace() {
            "" | "*" => None,
            ns => Some(ns),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    #[serde(default)]
    pub label_selector: LabelSelector,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_selectors: Option<SelectorConfig>,
}

impl DiscoveryConfig {
    pub fn by_name(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.map(str::to_string), by_name: Some(name.into()), by_selectors: None }
    }

    pub fn by_selectors(namespace: Option<&str>, selector: LabelSelector) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            by_name: None,
            by_selectors: Some(SelectorConfig { label_selector: selector }),
        }
    }

    /// Neither a name nor a non-empty selector: matches nothing.
    pub fn is_empty(&self) -> bool {
        self.name().is_none() && self.label_selector().is_empty()
    }
}

impl Discovery for DiscoveryConfig {
    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    fn name(&self) -> Option<&str> {
        self.by_name.as_deref().filter(|n| !n.is_empty())
    }

    fn label_selector(&self) -> String {
        self.by_selectors.as_ref().map(|s| s.label_selector.to_string()).unwrap_or_default()
    }
}

/// Namespace filter first, then exact name in single-resource mode, else the
/// label selector. A discovery with neither name nor selector matches nothing.
pub fn matches_discovery_criteria<K: Resource>(obj: &K, discovery: &dyn Discovery) -> bool {
    if let Some(ns) = discovery.scoped_namespace() {
        if obj.meta().namespace.as_deref() != Some(ns) {
            return false;
        }
    }
    if let Some(name) = discovery.name() {
        return obj.meta().name.as_deref() == Some(name);
    }
    let selector = discovery.label_selector();
    if selector.is_empty() {
        return false;
    }
    matches_labels(obj, &selector)
}

/// Manifests embedded in `parent` (its `spec.workload.manifests`) that match
/// `discovery`, in envelope order. Absent parent or list yields an empty vec;
/// an entry that is not a parseable object is a structural error naming its index.
pub fn discover_nested_manifest(parent: Option<&ManifestWork>, discovery: &dyn Discovery) -> Result<Vec<DynamicObject>> {
    let Some(work) = parent else {
        return Ok(Vec::new());
    };
    Ok(work.manifests()?.into_iter().filter(|m| matches_discovery_criteria(m, discovery)).collect())
}
