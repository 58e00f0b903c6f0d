//! Transport contract shared by the direct and broker-mediated backends.

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::decision::{ApplyDecision, Operation};
use crate::discovery::Discovery;
use crate::{RequestContext, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOptions {
    /// Execute a generation change as delete-then-create instead of an update.
    #[serde(default)]
    pub recreate_on_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub operation: Operation,
    pub reason: String,
}

impl From<ApplyDecision> for ApplyResult {
    fn from(d: ApplyDecision) -> Self {
        Self { operation: d.operation, reason: d.reason }
    }
}

/// Backend selection for one managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "client", rename_all = "lowercase")]
pub enum TransportConfig {
    Kubernetes,
    Maestro {
        #[serde(rename = "targetCluster")]
        target_cluster: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Kubernetes
    }
}

impl TransportConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Maestro { .. } => "maestro",
        }
    }

    pub fn routing(&self) -> RoutingContext {
        match self {
            Self::Kubernetes => RoutingContext::None,
            Self::Maestro { target_cluster } => RoutingContext::Broker { consumer: target_cluster.clone() },
        }
    }
}

/// Backend-specific addressing for a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RoutingContext {
    /// Direct backend; nothing to route.
    #[default]
    None,
    /// Broker backend; envelopes are addressed to `consumer`.
    Broker { consumer: String },
}

impl RoutingContext {
    pub fn consumer(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Broker { consumer } => Some(consumer.as_str()),
        }
    }
}

/// Apply / get / discover, implemented once per backend.
///
/// `apply_resource` runs discover → decide → execute strictly in sequence and
/// never retries. Implementations must be safe for concurrent use.
#[async_trait::async_trait]
pub trait TransportClient: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    async fn apply_resource(
        &self,
        ctx: &RequestContext,
        manifest: &[u8],
        opts: &ApplyOptions,
        routing: &RoutingContext,
    ) -> Result<ApplyResult>;

    /// Fetch one object; `Error::NotFound` when absent.
    async fn get_resource(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        routing: &RoutingContext,
    ) -> Result<DynamicObject>;

    /// Single fetch when `discovery.is_single_resource()`, selector listing
    /// otherwise. Nothing found is an empty vec.
    async fn discover_resources(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        discovery: &dyn Discovery,
        routing: &RoutingContext,
    ) -> Result<Vec<DynamicObject>>;
}
