//! Direct backend: manifests go straight to the target cluster's API server.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fleetsync_core::{
    compare_generations, describe, generation, gvk_of, matches_discovery_criteria, ApplyOptions, ApplyResult, Discovery,
    Error, RequestContext, Result, RoutingContext, TransportClient,
};
use fleetsync_kubehub::ResourceClient;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tracing::debug;

use crate::{execute_decision, parse_manifest, record_apply, ApplySettings};

pub struct KubeTransport {
    client: Arc<dyn ResourceClient>,
    settings: ApplySettings,
}

impl KubeTransport {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self::with_settings(client, ApplySettings::default())
    }

    pub fn with_settings(client: Arc<dyn ResourceClient>, settings: ApplySettings) -> Self {
        Self { client, settings }
    }

    async fn apply(&self, ctx: &RequestContext, manifest: &[u8], opts: &ApplyOptions) -> Result<ApplyResult> {
        let desired = parse_manifest(manifest, &self.settings)?;
        let new_gen = generation::validate_object(&desired)?;
        let gvk = gvk_of(&desired)?;
        let namespace = desired.metadata.namespace.clone();
        let existing = ctx.run(self.client.get_opt(&gvk, namespace.as_deref(), &desired.name_any())).await?;
        let decision = compare_generations(
            new_gen,
            generation::get_from(existing.as_ref()),
            existing.is_some(),
        )
        .with_recreate_policy(opts.recreate_on_change);
        debug!(resource = %describe(&desired), operation = %decision.operation, reason = %decision.reason, "decided");
        execute_decision(self.client.as_ref(), ctx, &gvk, desired, existing, &decision, &self.settings).await?;
        Ok(decision.into())
    }
}

#[async_trait]
impl TransportClient for KubeTransport {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn apply_resource(
        &self,
        ctx: &RequestContext,
        manifest: &[u8],
        opts: &ApplyOptions,
        _routing: &RoutingContext,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        let out = self.apply(ctx, manifest, opts).await;
        record_apply(self.backend(), &out, started);
        out
    }

    async fn get_resource(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        _routing: &RoutingContext,
    ) -> Result<DynamicObject> {
        ctx.run(self.client.get_opt(gvk, namespace, name))
            .await?
            .ok_or_else(|| Error::not_found(&gvk.kind, namespace, name))
    }

    async fn discover_resources(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        discovery: &dyn Discovery,
        _routing: &RoutingContext,
    ) -> Result<Vec<DynamicObject>> {
        let namespace = discovery.scoped_namespace();
        if let Some(name) = discovery.name() {
            let found = ctx.run(self.client.get_opt(gvk, namespace, name)).await?;
            return Ok(found.into_iter().filter(|o| matches_discovery_criteria(o, discovery)).collect());
        }
        let selector = discovery.label_selector();
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        let mut items = ctx.run(self.client.list(gvk, namespace, Some(&selector))).await?;
        items.retain(|o| matches_discovery_criteria(o, discovery));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_kubehub::MemoryResourceClient;

    #[test]
    fn backend_name_is_kubernetes() {
        let t = KubeTransport::new(Arc::new(MemoryResourceClient::new()));
        assert_eq!(t.backend(), "kubernetes");
    }
}
