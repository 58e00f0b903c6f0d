//! fleetsync reconciliation façade.
//!
//! [`Reconciler`] picks the transport a [`ManagedResource`] asks for, applies
//! it, then runs the resource's discovery so callers get the live object back.
//! Frontends (the `fleetctl` CLI, controllers) depend on this crate only.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use fleetsync_apply::{parse_manifest, ApplySettings, KubeTransport};
use fleetsync_core::{
    generation, gvk_of, ApplyResult, Discovery, Error, ManagedResource, RequestContext, Result, RoutingContext,
    TransportClient, TransportConfig,
};
use fleetsync_kubehub::ResourceClient;
use fleetsync_maestro::MaestroTransport;
use futures::stream::{self, StreamExt};
use kube::core::DynamicObject;
use serde::Serialize;
use tracing::info;

/// What one reconcile did and what discovery saw afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub name: String,
    pub result: ApplyResult,
    /// Highest-generation match of the resource's discovery, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered: Option<DynamicObject>,
}

pub struct Reconciler {
    kubernetes: Arc<dyn TransportClient>,
    maestro: Option<Arc<dyn TransportClient>>,
    settings: ApplySettings,
}

impl Reconciler {
    pub fn new(kubernetes: Arc<dyn TransportClient>) -> Self {
        Self { kubernetes, maestro: None, settings: ApplySettings::default() }
    }

    pub fn with_maestro(mut self, maestro: Arc<dyn TransportClient>) -> Self {
        self.maestro = Some(maestro);
        self
    }

    pub fn with_settings(mut self, settings: ApplySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Both backends over one client: direct applies and envelopes share the
    /// API server `client` points at.
    pub fn from_client(client: Arc<dyn ResourceClient>, settings: ApplySettings) -> Self {
        let kubernetes = Arc::new(KubeTransport::with_settings(client.clone(), settings.clone()));
        let maestro = Arc::new(MaestroTransport::with_settings(client, settings.clone()));
        Self::new(kubernetes).with_maestro(maestro).with_settings(settings)
    }

    pub fn transport_for(&self, config: &TransportConfig) -> Result<(Arc<dyn TransportClient>, RoutingContext)> {
        match config {
            TransportConfig::Kubernetes => Ok((self.kubernetes.clone(), RoutingContext::None)),
            TransportConfig::Maestro { .. } => {
                let maestro = self
                    .maestro
                    .clone()
                    .ok_or_else(|| Error::MissingRouting("maestro transport is not configured".into()))?;
                Ok((maestro, config.routing()))
            }
        }
    }

    /// Apply, then discover. Discovery runs against the rendered kind (the
    /// envelope kind when the manifest is a ManifestWork) and is skipped when
    /// the resource configures neither a name nor a selector.
    pub async fn reconcile(&self, ctx: &RequestContext, resource: &ManagedResource) -> Result<ReconcileOutcome> {
        let t0 = Instant::now();
        let config = resource.transport.clone().unwrap_or_default();
        let (transport, routing) = self.transport_for(&config)?;
        info!(name = %resource.name, backend = transport.backend(), "reconcile start");

        let result = transport.apply_resource(ctx, &resource.manifest, &resource.apply_options(), &routing).await?;

        let discovered = if resource.discovery.is_empty() {
            None
        } else {
            let gvk = gvk_of(&parse_manifest(&resource.manifest, &self.settings)?)?;
            let found = transport
                .discover_resources(ctx, &gvk, &resource.discovery as &dyn Discovery, &routing)
                .await?;
            generation::latest(&found)
        };
        info!(
            name = %resource.name,
            operation = %result.operation,
            discovered = discovered.is_some(),
            took_ms = %t0.elapsed().as_millis(),
            "reconcile ok"
        );
        Ok(ReconcileOutcome { name: resource.name.clone(), result, discovered })
    }

    /// Reconcile independent resources with at most `concurrency` in flight.
    /// Output follows input order; one failure does not stop the others.
    pub async fn reconcile_all(
        &self,
        ctx: &RequestContext,
        resources: &[ManagedResource],
        concurrency: usize,
    ) -> Vec<(String, Result<ReconcileOutcome>)> {
        let mut out: Vec<(usize, String, Result<ReconcileOutcome>)> = stream::iter(resources.iter().enumerate())
            .map(|(i, r)| async move { (i, r.name.clone(), self.reconcile(ctx, r).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        out.sort_by_key(|(i, _, _)| *i);
        out.into_iter().map(|(_, name, res)| (name, res)).collect()
    }
}
