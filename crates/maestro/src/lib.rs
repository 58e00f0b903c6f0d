//! fleetsync maestro: broker-mediated delivery.
//!
//! Manifests travel inside `ManifestWork` envelopes written to the hub in the
//! consumer's namespace; the broker fans them out to the target cluster.
//! Apply returns once the hub accepted the envelope.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fleetsync_apply::{execute_decision, parse_manifest, record_apply, ApplySettings};
use fleetsync_core::{
    compare_generations, discover_nested_manifest, generation, has_gvk, matches_discovery_criteria, ApplyOptions,
    ApplyResult, Discovery, DiscoveryConfig, Error, ManifestWork, RequestContext, Result, RoutingContext,
    TransportClient,
};
use fleetsync_kubehub::ResourceClient;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use tracing::debug;

/// A discovery pinned to the consumer namespace.
struct InConsumer<'a> {
    inner: &'a dyn Discovery,
    consumer: &'a str,
}

impl Discovery for InConsumer<'_> {
    fn namespace(&self) -> &str {
        self.consumer
    }

    fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    fn label_selector(&self) -> String {
        self.inner.label_selector()
    }
}

fn consumer_of(routing: &RoutingContext) -> Result<&str> {
    match routing.consumer() {
        Some(c) if !c.is_empty() => Ok(c),
        Some(_) => Err(Error::MissingRouting("empty broker consumer".into())),
        None => Err(Error::MissingRouting("maestro transport requires a target cluster".into())),
    }
}

pub struct MaestroTransport {
    hub: Arc<dyn ResourceClient>,
    settings: ApplySettings,
}

impl MaestroTransport {
    /// `hub` talks to the cluster hosting the ManifestWork API.
    pub fn new(hub: Arc<dyn ResourceClient>) -> Self {
        Self::with_settings(hub, ApplySettings::default())
    }

    pub fn with_settings(hub: Arc<dyn ResourceClient>, settings: ApplySettings) -> Self {
        Self { hub, settings }
    }

    /// Envelope for the rendered bytes: used as-is when it already is a
    /// ManifestWork, otherwise generated around the single manifest.
    fn envelope(&self, manifest: &[u8], consumer: &str) -> Result<ManifestWork> {
        let obj = parse_manifest(manifest, &self.settings)?;
        let mut work = if ManifestWork::is_envelope(&obj) {
            ManifestWork::from_dynamic(&obj)?
        } else {
            ManifestWork::wrap(&obj)?
        };
        work.metadata.namespace = Some(consumer.to_string());
        Ok(work)
    }

    async fn apply(
        &self,
        ctx: &RequestContext,
        manifest: &[u8],
        opts: &ApplyOptions,
        routing: &RoutingContext,
    ) -> Result<ApplyResult> {
        let consumer = consumer_of(routing)?;
        let work = self.envelope(manifest, consumer)?;
        let new_gen = generation::validate_envelope(&work)?;
        let gvk = ManifestWork::gvk();
        let existing = ctx.run(self.hub.get_opt(&gvk, Some(consumer), &work.name_any())).await?;
        let decision = compare_generations(new_gen, generation::get_from(existing.as_ref()), existing.is_some())
            .with_recreate_policy(opts.recreate_on_change);
        debug!(
            consumer,
            envelope = %work.name_any(),
            operation = %decision.operation,
            reason = %decision.reason,
            "decided"
        );
        execute_decision(self.hub.as_ref(), ctx, &gvk, work.to_dynamic()?, existing, &decision, &self.settings).await?;
        Ok(decision.into())
    }

    /// Inner manifests of kind `gvk` across the consumer's envelopes.
    async fn nested(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        discovery: &dyn Discovery,
        consumer: &str,
    ) -> Result<Vec<DynamicObject>> {
        let envelopes = ctx.run(self.hub.list(&ManifestWork::gvk(), Some(consumer), None)).await?;
        let mut found = Vec::new();
        for env in &envelopes {
            let work = ManifestWork::from_dynamic(env)?;
            found.extend(
                discover_nested_manifest(Some(&work), discovery)?
                    .into_iter()
                    .filter(|m| has_gvk(m, gvk)),
            );
        }
        Ok(found)
    }
}

#[async_trait]
impl TransportClient for MaestroTransport {
    fn backend(&self) -> &'static str {
        "maestro"
    }

    async fn apply_resource(
        &self,
        ctx: &RequestContext,
        manifest: &[u8],
        opts: &ApplyOptions,
        routing: &RoutingContext,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        let out = self.apply(ctx, manifest, opts, routing).await;
        record_apply(self.backend(), &out, started);
        out
    }

    async fn get_resource(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        routing: &RoutingContext,
    ) -> Result<DynamicObject> {
        let consumer = consumer_of(routing)?;
        if *gvk == ManifestWork::gvk() {
            return ctx
                .run(self.hub.get_opt(gvk, Some(consumer), name))
                .await?
                .ok_or_else(|| Error::not_found(&gvk.kind, Some(consumer), name));
        }
        let by_name = DiscoveryConfig::by_name(namespace, name);
        let matches = self.nested(ctx, gvk, &by_name, consumer).await?;
        generation::latest(&matches).ok_or_else(|| Error::not_found(&gvk.kind, namespace, name))
    }

    async fn discover_resources(
        &self,
        ctx: &RequestContext,
        gvk: &GroupVersionKind,
        discovery: &dyn Discovery,
        routing: &RoutingContext,
    ) -> Result<Vec<DynamicObject>> {
        let consumer = consumer_of(routing)?;
        if *gvk != ManifestWork::gvk() {
            return self.nested(ctx, gvk, discovery, consumer).await;
        }
        let scoped = InConsumer { inner: discovery, consumer };
        if let Some(name) = scoped.name() {
            let found = ctx.run(self.hub.get_opt(gvk, Some(consumer), name)).await?;
            return Ok(found.into_iter().collect());
        }
        let selector = scoped.label_selector();
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        let mut items = ctx.run(self.hub.list(gvk, Some(consumer), Some(&selector))).await?;
        items.retain(|o| matches_discovery_criteria(o, &scoped));
        Ok(items)
    }
}
