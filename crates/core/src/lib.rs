//! fleetsync core types: generation model, decision engine, discovery and
//! the backend-agnostic transport contract.
//!
//! Nothing in this crate talks to a cluster. Backends live in
//! `fleetsync-apply` (direct API) and `fleetsync-maestro` (broker delivery).

#![forbid(unsafe_code)]

pub mod context;
pub mod decision;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod generation;
pub mod labels;
pub mod transport;

use kube::core::{DynamicObject, GroupVersionKind};

pub use context::RequestContext;
pub use decision::{compare_generations, ApplyDecision, Operation};
pub use discovery::{discover_nested_manifest, matches_discovery_criteria, Discovery, DiscoveryConfig, SelectorConfig};
pub use envelope::ManifestWork;
pub use error::{Error, Result};
pub use labels::{build_label_selector, matches_labels, LabelSelector};
pub use transport::{ApplyOptions, ApplyResult, RoutingContext, TransportClient, TransportConfig};

/// Annotation carrying the render generation of a managed object.
pub const GENERATION_ANNOTATION: &str = "fleetsync.io/generation";

pub mod prelude {
    pub use super::{
        ApplyDecision, ApplyOptions, ApplyResult, Discovery, DiscoveryConfig, Error, ManagedResource, ManifestWork,
        Operation, RequestContext, Result, RoutingContext, TransportClient, TransportConfig,
    };
}

/// A rendered resource handed over by the pipeline for exactly one apply.
#[derive(Debug, Clone)]
pub struct ManagedResource {
    /// Stable identifier used for logs and result binding.
    pub name: String,
    /// Fully rendered manifest (YAML or JSON). For the broker transport this is
    /// either a `ManifestWork` envelope or a single manifest to wrap.
    pub manifest: Vec<u8>,
    pub discovery: DiscoveryConfig,
    /// `None` selects the direct kubernetes transport.
    pub transport: Option<TransportConfig>,
    pub recreate_on_change: bool,
}

impl ManagedResource {
    pub fn new(name: impl Into<String>, manifest: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
            discovery: DiscoveryConfig::default(),
            transport: None,
            recreate_on_change: false,
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn recreate_on_change(mut self, on: bool) -> Self {
        self.recreate_on_change = on;
        self
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions { recreate_on_change: self.recreate_on_change }
    }
}

/// Kind of a dynamic object, empty when type metadata is absent.
pub fn object_kind(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

/// `Kind/name` (or `Kind/namespace/name`) for error messages and logs.
pub fn describe(obj: &DynamicObject) -> String {
    let kind = match object_kind(obj) {
        "" => "<unknown kind>",
        k => k,
    };
    let name = obj.metadata.name.as_deref().unwrap_or("<unnamed>");
    match obj.metadata.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}/{}", kind, ns, name),
        _ => format!("{}/{}", kind, name),
    }
}

/// Group/version/kind from an object's `apiVersion` and `kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::structural(describe(obj), None, "missing apiVersion/kind"))?;
    if types.api_version.is_empty() || types.kind.is_empty() {
        return Err(Error::structural(describe(obj), None, "empty apiVersion or kind"));
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Ok(GroupVersionKind { group, version, kind: types.kind.clone() })
}

/// True when the object's apiVersion and kind equal the given GVK.
pub fn has_gvk(obj: &DynamicObject, gvk: &GroupVersionKind) -> bool {
    obj.types
        .as_ref()
        .map(|t| t.kind == gvk.kind && t.api_version == gvk.api_version())
        .unwrap_or(false)
}
