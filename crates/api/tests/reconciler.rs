use std::sync::Arc;

use fleetsync_api::Reconciler;
use fleetsync_apply::ApplySettings;
use fleetsync_core::{
    DiscoveryConfig, LabelSelector, ManagedResource, ManifestWork, Operation, RequestContext, TransportConfig,
};
use fleetsync_kubehub::MemoryResourceClient;
use kube::core::GroupVersionKind;
use kube::ResourceExt;

fn manifest(name: &str, gen: u32) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: apps\n  labels:\n    tier: web\n  annotations:\n    fleetsync.io/generation: \"{gen}\"\n"
    )
}

fn setup() -> (Arc<MemoryResourceClient>, Reconciler) {
    let mem = Arc::new(MemoryResourceClient::new());
    let r = Reconciler::from_client(mem.clone(), ApplySettings::default());
    (mem, r)
}

#[tokio::test]
async fn reconcile_applies_then_discovers() {
    let (_mem, r) = setup();
    let res = ManagedResource::new("web-config", manifest("web", 2))
        .with_discovery(DiscoveryConfig::by_name(Some("apps"), "web"));
    let out = r.reconcile(&RequestContext::new(), &res).await.unwrap();
    assert_eq!(out.name, "web-config");
    assert_eq!(out.result.operation, Operation::Create);
    let live = out.discovered.unwrap();
    assert_eq!(live.name_any(), "web");

    let again = r.reconcile(&RequestContext::new(), &res).await.unwrap();
    assert_eq!(again.result.operation, Operation::Skip);
}

#[tokio::test]
async fn reconcile_without_discovery_reports_none() {
    let (_mem, r) = setup();
    let out = r.reconcile(&RequestContext::new(), &ManagedResource::new("a", manifest("a", 1))).await.unwrap();
    assert!(out.discovered.is_none());
    let json = serde_json::to_value(&out).unwrap();
    assert_eq!(json["result"]["operation"], "create");
    assert!(json.get("discovered").is_none());
}

#[tokio::test]
async fn reconcile_routes_to_broker() {
    let (mem, r) = setup();
    let res = ManagedResource::new("remote", manifest("remote", 1))
        .with_transport(TransportConfig::Maestro { target_cluster: "edge-1".into() })
        .with_discovery(DiscoveryConfig::by_selectors(None, LabelSelector::parse("tier=web")));
    let out = r.reconcile(&RequestContext::new(), &res).await.unwrap();
    assert_eq!(out.result.operation, Operation::Create);
    assert!(mem.stored(&ManifestWork::gvk(), Some("edge-1"), "configmap-apps-remote").is_some());
    assert!(mem.stored(&GroupVersionKind::gvk("", "v1", "ConfigMap"), Some("apps"), "remote").is_none());
    assert_eq!(out.discovered.map(|o| o.name_any()).as_deref(), Some("remote"));
}

#[tokio::test]
async fn reconcile_all_keeps_input_order_and_isolates_failures() {
    let (mem, r) = setup();
    let resources: Vec<_> = (1..=6)
        .map(|i| {
            if i == 3 {
                ManagedResource::new(format!("r{i}"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: bad\n")
            } else {
                ManagedResource::new(format!("r{i}"), manifest(&format!("cm-{i}"), i))
            }
        })
        .collect();
    let out = r.reconcile_all(&RequestContext::new(), &resources, 3).await;
    let names: Vec<_> = out.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["r1", "r2", "r3", "r4", "r5", "r6"]);
    assert!(out[2].1.is_err());
    assert_eq!(out.iter().filter(|(_, r)| r.is_ok()).count(), 5);
    assert_eq!(mem.len(), 5);
}

#[tokio::test]
async fn cancelled_batch_fails_every_item() {
    let (mem, r) = setup();
    let ctx = RequestContext::new();
    ctx.cancel();
    let resources = vec![ManagedResource::new("a", manifest("a", 1)), ManagedResource::new("b", manifest("b", 1))];
    let out = r.reconcile_all(&ctx, &resources, 0).await;
    assert!(out.iter().all(|(_, r)| r.as_ref().err().map(|e| e.is_cancelled()).unwrap_or(false)));
    assert_eq!(mem.mutation_count(), 0);
}
